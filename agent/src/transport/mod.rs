pub mod ws;

pub use ws::WsClient;
