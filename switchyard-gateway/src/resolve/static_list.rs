//! Fixed endpoint sets for disabled discovery.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::resolve::EndpointResolver;
use switchyard_core::domain::endpoint::{Endpoint, ServiceName};
use switchyard_core::error::GatewayError;

/// Serves endpoint sets straight from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticListResolver {
    services: BTreeMap<ServiceName, Vec<Endpoint>>,
}

impl StaticListResolver {
    /// Creates the resolver from a configured service map.
    pub fn new(services: BTreeMap<ServiceName, Vec<Endpoint>>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl EndpointResolver for StaticListResolver {
    async fn resolve(&self, service: &ServiceName) -> Result<Vec<Endpoint>, GatewayError> {
        match self.services.get(service) {
            Some(endpoints) if !endpoints.is_empty() => Ok(endpoints.clone()),
            _ => Err(GatewayError::Resolution(service.to_string())),
        }
    }
}
