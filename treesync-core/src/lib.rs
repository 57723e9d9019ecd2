mod client;
mod connector;

pub use client::{HttpConnection, HttpConnector};
pub use connector::{
    ByteStream, ConnectionParams, Connector, EntryKind, RemoteConnection, RemoteEntry, RemoteError,
};
