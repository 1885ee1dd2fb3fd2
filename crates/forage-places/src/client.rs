use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransport;
use rmcp::{RoleClient, ServiceExt};

use forage_core::config::{PlacesConfig, PlacesTransport};
use forage_core::error::{ForageError, Result};
use forage_core::geo::{GeocodeHit, NearbyPlaces, NearbyQuery};
use forage_core::traits::PlacesService;

use crate::handler::PlacesClientHandler;
use crate::parse::{parse_geocode, parse_nearby};

type McpConnection = RunningService<RoleClient, PlacesClientHandler>;

const SERVER_NAME: &str = "osm";
const GEOCODE_TOOL: &str = "geocode_address";
const NEARBY_TOOL: &str = "find_nearby_places";

/// Places service backed by an OpenStreetMap MCP server.
///
/// Connects lazily on first use. Every tool call is bounded by the
/// configured timeout; a closed transport is reconnected once.
pub struct OsmPlaces {
    config: PlacesConfig,
    connection: Mutex<Option<McpConnection>>,
}

impl OsmPlaces {
    pub fn new(config: PlacesConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn open(&self) -> Result<McpConnection> {
        let handler = PlacesClientHandler::new(SERVER_NAME);

        let client = match &self.config.transport {
            PlacesTransport::Stdio { command, args, env } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);
                for (k, v) in env {
                    cmd.env(k, v);
                }

                let transport = rmcp::transport::TokioChildProcess::new(cmd)
                    .map_err(|e| ForageError::Mcp(format!("Failed to spawn {}: {}", command, e)))?;

                handler
                    .serve(transport)
                    .await
                    .map_err(|e| ForageError::Mcp(format!("Places server init failed: {}", e)))?
            }
            PlacesTransport::Http { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.as_str());

                <PlacesClientHandler as ServiceExt<RoleClient>>::serve(handler, transport)
                    .await
                    .map_err(|e| {
                        ForageError::Mcp(format!("Places server init at {} failed: {}", url, e))
                    })?
            }
        };

        info!(server = SERVER_NAME, "Places server connected");
        Ok(client)
    }

    /// Connect now instead of on first call. Bounded by the call timeout.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if guard.as_ref().is_some_and(|c| !c.is_closed()) {
            return Ok(());
        }
        let conn = tokio::time::timeout(self.timeout(), self.open())
            .await
            .map_err(|_| ForageError::PlacesTimeout {
                operation: "connect".into(),
                timeout_secs: self.config.timeout_secs,
            })??;
        *guard = Some(conn);
        Ok(())
    }

    /// Close the connection if open.
    pub async fn disconnect(&self) {
        if let Some(mut conn) = self.connection.lock().await.take() {
            let _ = conn.close().await;
            info!(server = SERVER_NAME, "Places server disconnected");
        }
    }

    /// Call a tool, reconnecting once if the transport was closed.
    pub async fn call_tool(&self, tool: &str, arguments: serde_json::Value) -> Result<String> {
        let arguments = match arguments {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        };

        let result = self.call_with_timeout(tool, arguments.clone()).await;

        if let Err(ref e) = result {
            let err_str = e.to_string();
            if err_str.contains("closed") || err_str.contains("Transport") {
                warn!(server = SERVER_NAME, tool, "Places transport closed, attempting reconnect");
                self.disconnect().await;
                return self.call_with_timeout(tool, arguments).await;
            }
        }

        result
    }

    async fn call_with_timeout(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<String> {
        tokio::time::timeout(self.timeout(), self.call_inner(tool, arguments))
            .await
            .map_err(|_| ForageError::PlacesTimeout {
                operation: tool.to_string(),
                timeout_secs: self.config.timeout_secs,
            })?
    }

    async fn call_inner(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<String> {
        let mut guard = self.connection.lock().await;
        if guard.as_ref().map_or(true, |c| c.is_closed()) {
            *guard = Some(self.open().await?);
        }
        let client = guard
            .as_ref()
            .ok_or_else(|| ForageError::Mcp("Places server not connected".into()))?;

        let params = CallToolRequestParams {
            name: tool.to_string().into(),
            arguments,
            meta: None,
            task: None,
        };

        let result = client
            .call_tool(params)
            .await
            .map_err(|e| ForageError::Mcp(format!("Tool call '{}' failed: {}", tool, e)))?;

        let text: Vec<String> = result
            .content
            .iter()
            .filter_map(|c| match c.raw {
                rmcp::model::RawContent::Text(ref t) => Some(t.text.to_string()),
                _ => None,
            })
            .collect();

        if result.is_error == Some(true) {
            return Err(ForageError::Places(format!("{tool}: {}", text.join("\n"))));
        }

        // the payload is a single JSON text block; take the first
        text.into_iter()
            .next()
            .ok_or_else(|| ForageError::Places(format!("{tool} returned no text content")))
    }
}

impl PlacesService for OsmPlaces {
    fn geocode(&self, query: &str) -> BoxFuture<'_, Result<Option<GeocodeHit>>> {
        let query = query.to_string();
        Box::pin(async move {
            let text = self
                .call_tool(GEOCODE_TOOL, serde_json::json!({ "address": query }))
                .await?;
            let hit = parse_geocode(&text)?;
            debug!(query = %query, found = hit.is_some(), "Geocoded");
            Ok(hit)
        })
    }

    fn find_nearby(&self, query: NearbyQuery) -> BoxFuture<'_, Result<NearbyPlaces>> {
        Box::pin(async move {
            let text = self
                .call_tool(
                    NEARBY_TOOL,
                    serde_json::json!({
                        "latitude": query.latitude,
                        "longitude": query.longitude,
                        "radius": query.radius_m,
                        "categories": query.categories,
                        "limit": query.limit,
                    }),
                )
                .await?;
            let nearby = parse_nearby(&text)?;
            debug!(total = nearby.total_count, "Fetched nearby places");
            Ok(nearby)
        })
    }
}
