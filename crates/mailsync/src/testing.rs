//! Shared fixtures for unit tests

use crate::connection::ResilientConnection;
use crate::imap::{Credentials, InMemoryServer, InMemorySessionFactory};

pub(crate) fn connect(server: &InMemoryServer) -> ResilientConnection<InMemorySessionFactory> {
    ResilientConnection::new(
        "imap.example.com",
        server.factory(),
        Credentials::password("me@example.com", "secret"),
    )
}
