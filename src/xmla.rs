//! Remote tabular model access over XMLA.
//!
//! The session layer talks to the remote server only through the
//! [`XmlaConnector`] and [`XmlaConnection`] traits. [`HttpConnector`] is the
//! production implementation (SOAP over HTTPS with Azure AD bearer tokens);
//! tests substitute in-memory fakes.

mod auth;
pub mod catalog;
mod client;
pub mod endpoint;
pub mod soap;
pub mod types;

pub use auth::{AccessToken, TokenProvider};
pub use client::HttpConnector;
pub use endpoint::{EndpointKind, XmlaEndpoint};
pub use types::{
    CellValue, ColumnDescriptor, ConnectParams, EntityDescriptor, EntityKind, MeasureDescriptor,
    RelationshipDescriptor, Rowset, RowsetColumn,
};

use crate::error::ServerError;
use async_trait::async_trait;

/// Opens authenticated connections to a remote catalog.
#[async_trait]
pub trait XmlaConnector: Send + Sync {
    /// Perform the handshake: authenticate and prove the catalog is reachable.
    ///
    /// Fails with `Authentication` when credentials are rejected and with
    /// `Connection` for anything else.
    async fn open(&self, params: &ConnectParams) -> Result<Box<dyn XmlaConnection>, ServerError>;
}

/// A live connection to one catalog.
///
/// Every method is one or more remote round trips. Errors for which
/// [`ServerError::is_session_fatal`] holds mean the connection is unusable.
#[async_trait]
pub trait XmlaConnection: Send + Sync {
    /// Run a statement (DAX or DMV) and return its rowset.
    async fn execute(&mut self, statement: &str) -> Result<Rowset, ServerError>;

    /// Enumerate every user-facing entity in the catalog, in server order.
    async fn list_entities(&mut self) -> Result<Vec<EntityDescriptor>, ServerError>;

    /// Describe one entity, or `None` when the catalog has no such name.
    async fn describe_entity(&mut self, name: &str)
        -> Result<Option<EntityDescriptor>, ServerError>;

    /// Release the transport. Best effort; never fails.
    async fn close(&mut self);
}
