/// Endpoint list served by the cluster itself
///
/// Coordinators answer `GET /_api/cluster/endpoints` with
/// `{"endpoints":[{"endpoint":"tcp://host:port"}, ...]}`.
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::HostListSource;
use crate::core::{Endpoint, Request, Response};
use crate::error::{RouterError, RouterResult};
use crate::router::RequestRouter;

pub const CLUSTER_ENDPOINTS_PATH: &str = "/_api/cluster/endpoints";

#[derive(Debug, Deserialize)]
struct EndpointList {
    endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Deserialize)]
struct EndpointEntry {
    endpoint: String,
}

/// Host-list source querying the cluster endpoint API through the router
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterEndpoints;

#[async_trait]
impl HostListSource for ClusterEndpoints {
    async fn fetch(&self, router: &RequestRouter) -> RouterResult<Vec<Endpoint>> {
        let response = router.execute(Request::get(CLUSTER_ENDPOINTS_PATH)).await?;
        parse_endpoint_list(&response)
    }
}

/// Decode an endpoint list response
pub fn parse_endpoint_list(response: &Response) -> RouterResult<Vec<Endpoint>> {
    if !response.is_success() {
        return Err(RouterError::protocol(format!(
            "endpoint list request failed with status {}",
            response.status
        )));
    }

    let list: EndpointList = response.json()?;
    let endpoints = list
        .endpoints
        .iter()
        .map(|entry| Endpoint::parse(&entry.endpoint))
        .collect::<RouterResult<Vec<_>>>()?;

    debug!("Cluster reported {} endpoints", endpoints.len());
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_list() {
        let response = Response::new(200).with_body(
            r#"{"error":false,"code":200,"endpoints":[{"endpoint":"tcp://127.0.0.1:8530"},{"endpoint":"tcp://127.0.0.1:8531"}]}"#,
        );

        let endpoints = parse_endpoint_list(&response).unwrap();
        assert_eq!(
            endpoints,
            vec![Endpoint::new("127.0.0.1", 8530), Endpoint::new("127.0.0.1", 8531)]
        );
    }

    #[test]
    fn test_parse_endpoint_list_errors() {
        let not_found = Response::new(404).with_body("{}");
        assert!(parse_endpoint_list(&not_found).is_err());

        let wrong_shape = Response::new(200).with_body(r#"{"hosts":[]}"#);
        assert!(parse_endpoint_list(&wrong_shape).is_err());

        let bad_entry = Response::new(200).with_body(r#"{"endpoints":[{"endpoint":"nowhere"}]}"#);
        assert!(matches!(
            parse_endpoint_list(&bad_entry),
            Err(RouterError::InvalidEndpoint { .. })
        ));
    }
}
