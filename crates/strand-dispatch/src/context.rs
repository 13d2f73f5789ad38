//! Per-request state and the read-only view handed to filters.

use std::sync::Arc;

use strand_net::InterfaceData;

use crate::resource::{Params, Resource};

/// Everything known about a request once its resource is resolved and its
/// parameters are bound.
#[derive(Debug)]
pub struct RequestContext {
    connection_id: String,
    request: InterfaceData,
    resource: Arc<Resource>,
    params: Params,
}

impl RequestContext {
    /// Context for `request` served by `resource` on `connection_id`.
    pub fn new(
        connection_id: impl Into<String>,
        request: InterfaceData,
        resource: Arc<Resource>,
        params: Params,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            request,
            resource,
            params,
        }
    }

    /// The resolved resource.
    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    /// Bound parameters.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The decoded request envelope.
    pub fn request(&self) -> &InterfaceData {
        &self.request
    }

    /// Borrow a read-only view for filters.
    pub fn view(&self) -> RequestView<'_> {
        RequestView {
            connection_id: &self.connection_id,
            request: &self.request,
            resource: &self.resource,
            params: &self.params,
        }
    }
}

/// Read-only view of a [`RequestContext`].
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    connection_id: &'a str,
    request: &'a InterfaceData,
    resource: &'a Resource,
    params: &'a Params,
}

impl<'a> RequestView<'a> {
    /// Originating connection.
    pub fn connection_id(&self) -> &'a str {
        self.connection_id
    }

    /// Correlation id of the request.
    pub fn id(&self) -> &'a str {
        &self.request.id
    }

    /// Path as sent by the peer.
    pub fn invoke(&self) -> &'a str {
        &self.request.invoke
    }

    /// Raw request payload.
    pub fn data(&self) -> Option<&'a str> {
        self.request.data.as_deref()
    }

    /// Resolved resource.
    pub fn resource(&self) -> &'a Resource {
        self.resource
    }

    /// Bound parameters.
    pub fn params(&self) -> &'a Params {
        self.params
    }
}
