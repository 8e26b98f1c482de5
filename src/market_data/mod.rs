// Market data module entrypoint
pub mod adapters;    // feed connector trait + Coinbase websocket connector
pub mod rate_meter;  // per-second inbound message telemetry
pub mod dispatcher;  // raw message -> classification -> accumulator
pub mod router;      // VWAP service: run/stop state machine around the dispatcher
