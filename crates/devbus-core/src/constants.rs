//! Wire paths, reserved channel names, and defaults shared by client and server.

/// Default port for the server bus and the client bridge.
pub const DEFAULT_PORT: u16 = 4206;

/// Default host for the server bus and the client bridge.
pub const DEFAULT_HOST: &str = "localhost";

/// WebSocket upgrade endpoint.
pub const WS_PATH: &str = "/__devtools/ws";

/// Server-sent event stream endpoint.
pub const SSE_PATH: &str = "/__devtools/sse";

/// One-shot HTTP POST ingress endpoint.
pub const SEND_PATH: &str = "/__devtools/send";

/// Liveness endpoint mounted next to the bus surfaces.
pub const HEALTH_PATH: &str = "/__devtools/health";

/// Query parameter a peer uses to identify itself to the server bus.
pub const CLIENT_ID_PARAM: &str = "clientId";

/// Channel that receives every published event regardless of type.
pub const ALL_EVENTS_CHANNEL: &str = "devtools-global";

/// Control channel: a producer asks the client bus to fan an envelope out.
pub const DISPATCH_CHANNEL: &str = "devtools-dispatch-event";

/// Control channel: a plugin client asks whether a client bus is listening.
pub const CONNECT_CHANNEL: &str = "devtools-connect";

/// Control channel: the client bus acknowledges a connect request.
pub const CONNECT_SUCCESS_CHANNEL: &str = "devtools-connect-success";

/// Separator between plugin id and event name on the wire.
pub const PLUGIN_SEPARATOR: char = ':';

/// Connect attempts a plugin client makes before giving up.
pub const MAX_CONNECT_ATTEMPTS: u32 = 5;
