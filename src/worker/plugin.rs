//! Plugin capability model: the manifest a plugin declares, the optional
//! lifecycle hooks it implements, and the registry of capabilities it
//! builds during global initialization.
//!
//! Plugins are compiled into the binary and resolved by id through
//! [`load_plugin`]. Hooks are plain optional callback fields checked at
//! load time rather than probed at call time.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::mcp::ToolRouter;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub webhooks: Vec<WebhookSpec>,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerSpec>,
}

/// A subprocess MCP tool server the worker spawns for the organization
/// and registers with its tool router during org initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerSpec {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One inbound webhook a plugin accepts, relative to
/// `/webhooks/{plugin}/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSpec {
    pub path: String,
    pub method: String,
    /// Header carrying the request signature. Absent means the webhook is
    /// accepted unsigned.
    #[serde(default)]
    pub signature_header: Option<String>,
    /// Key in the organization's merged environment holding the shared
    /// secret for signature verification.
    #[serde(default)]
    pub secret_key: Option<String>,
}

/// Auth state as submitted to `/validate-auth`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthState {
    #[serde(rename = "methodId")]
    pub method_id: String,
    #[serde(default)]
    pub credentials: Value,
}

/// Per-organization runtime data handed to org-scoped hooks.
#[derive(Clone)]
pub struct PluginContext {
    pub organization_id: String,
    pub config: Value,
    pub auth: Value,
    pub tools: Arc<ToolRouter>,
}

pub type InitHook = Arc<dyn Fn(Arc<CapabilityRegistry>) -> BoxFuture<()> + Send + Sync>;
pub type OrgHook = Arc<dyn Fn(PluginContext) -> BoxFuture<()> + Send + Sync>;
pub type ValidateAuthHook = Arc<dyn Fn(AuthState) -> BoxFuture<bool> + Send + Sync>;
pub type ConfigUpdateHook = Arc<dyn Fn(Value) -> BoxFuture<()> + Send + Sync>;

/// The fixed hook set a plugin may implement. `on_initialize` runs once
/// before the HTTP server starts and must not do per-organization I/O;
/// the rest run with org runtime data available.
#[derive(Clone, Default)]
pub struct PluginHooks {
    pub on_initialize: Option<InitHook>,
    pub on_start: Option<OrgHook>,
    pub on_validate_auth: Option<ValidateAuthHook>,
    pub on_config_update: Option<ConfigUpdateHook>,
    pub on_disable: Option<OrgHook>,
    pub on_enable: Option<OrgHook>,
}

#[derive(Clone)]
pub struct Plugin {
    pub manifest: PluginManifest,
    pub hooks: PluginHooks,
}

// --- Capability registry ---

pub struct RouteRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: String,
}

pub struct RouteResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl RouteResponse {
    pub fn json(body: Value) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body,
        }
    }
}

pub type RouteHandler = Arc<dyn Fn(RouteRequest) -> BoxFuture<RouteResponse> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct AuthMethod {
    pub id: String,
    pub label: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiExtension {
    pub id: String,
    pub slot: String,
    pub entry: String,
}

/// Everything a plugin registers during global initialization: its route
/// table, config schema, auth methods and UI extensions.
#[derive(Default)]
pub struct CapabilityRegistry {
    config_schema: Mutex<Value>,
    auth_methods: Mutex<Vec<AuthMethod>>,
    ui_extensions: Mutex<Vec<UiExtension>>,
    routes: Mutex<HashMap<(String, String), RouteHandler>>,
}

impl CapabilityRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_config_schema(&self, schema: Value) {
        *self.config_schema.lock().await = schema;
    }

    pub async fn add_auth_method(&self, method: AuthMethod) {
        self.auth_methods.lock().await.push(method);
    }

    pub async fn add_ui_extension(&self, extension: UiExtension) {
        self.ui_extensions.lock().await.push(extension);
    }

    pub async fn register_route(&self, method: &str, path: &str, handler: RouteHandler) {
        let key = route_key(method, path);
        self.routes.lock().await.insert(key, handler);
    }

    pub async fn route(&self, method: &str, path: &str) -> Option<RouteHandler> {
        self.routes.lock().await.get(&route_key(method, path)).cloned()
    }

    /// Capability descriptor served by `/metadata`.
    pub async fn descriptor(&self) -> Value {
        let routes: Vec<Value> = {
            let mut keys: Vec<(String, String)> =
                self.routes.lock().await.keys().cloned().collect();
            keys.sort();
            keys.into_iter()
                .map(|(method, path)| serde_json::json!({ "method": method, "path": path }))
                .collect()
        };
        serde_json::json!({
            "configSchema": self.config_schema.lock().await.clone(),
            "authMethods": self.auth_methods.lock().await.clone(),
            "uiExtensions": self.ui_extensions.lock().await.clone(),
            "routes": routes,
        })
    }
}

fn route_key(method: &str, path: &str) -> (String, String) {
    (
        method.to_uppercase(),
        path.trim_start_matches('/').to_string(),
    )
}

// --- Built-in plugin registry ---

const KNOWN_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

/// Resolve a plugin by id and validate its manifest.
pub fn load_plugin(plugin_id: &str) -> Result<Plugin> {
    let plugin = match plugin_id {
        "echo" => echo_plugin(),
        other => bail!("unknown plugin '{}'", other),
    };
    validate_manifest(&plugin.manifest)?;
    Ok(plugin)
}

/// Manifests of every compiled-in plugin, keyed by plugin id. The
/// gateway resolves inbound webhooks against this table.
pub fn builtin_manifests() -> HashMap<String, PluginManifest> {
    let mut manifests = HashMap::new();
    for plugin in [echo_plugin()] {
        manifests.insert(plugin.manifest.name.clone(), plugin.manifest);
    }
    manifests
}

fn validate_manifest(manifest: &PluginManifest) -> Result<()> {
    if manifest.name.trim().is_empty() {
        bail!("plugin manifest has an empty name");
    }
    if manifest.version.trim().is_empty() {
        bail!("plugin '{}' has an empty version", manifest.name);
    }
    for webhook in &manifest.webhooks {
        let method = webhook.method.to_uppercase();
        if !KNOWN_METHODS.contains(&method.as_str()) {
            bail!(
                "plugin '{}' webhook '{}' has unsupported method '{}'",
                manifest.name,
                webhook.path,
                webhook.method
            );
        }
        if webhook.signature_header.is_some() && webhook.secret_key.is_none() {
            bail!(
                "plugin '{}' webhook '{}' declares a signature header without a secret key",
                manifest.name,
                webhook.path
            );
        }
    }
    for server in &manifest.tool_servers {
        if server.id.trim().is_empty() || server.command.trim().is_empty() {
            bail!(
                "plugin '{}' declares a tool server without an id or command",
                manifest.name
            );
        }
    }
    Ok(())
}

/// Reference plugin: a ping route, a signed inbound webhook and one local
/// MCP tool.
fn echo_plugin() -> Plugin {
    let manifest = PluginManifest {
        name: "echo".to_string(),
        version: "0.1.0".to_string(),
        description: "Echoes requests back; smoke-test plugin".to_string(),
        webhooks: vec![
            WebhookSpec {
                path: "events".to_string(),
                method: "POST".to_string(),
                signature_header: Some("X-Hub-Signature-256".to_string()),
                secret_key: Some("ECHO_WEBHOOK_SECRET".to_string()),
            },
            WebhookSpec {
                path: "ping".to_string(),
                method: "POST".to_string(),
                signature_header: None,
                secret_key: None,
            },
        ],
        tool_servers: Vec::new(),
    };

    let on_initialize: InitHook = Arc::new(|capabilities: Arc<CapabilityRegistry>| {
        Box::pin(async move {
            capabilities
                .set_config_schema(serde_json::json!({
                    "type": "object",
                    "properties": { "greeting": { "type": "string" } }
                }))
                .await;
            capabilities
                .add_auth_method(AuthMethod {
                    id: "api-key".to_string(),
                    label: "API key".to_string(),
                    kind: "secret".to_string(),
                })
                .await;
            let handler: RouteHandler = Arc::new(|request: RouteRequest| {
                Box::pin(async move {
                    Ok(RouteResponse::json(serde_json::json!({
                        "echo": request.body,
                        "path": request.path,
                    })))
                })
            });
            capabilities.register_route("POST", "events", handler.clone()).await;
            capabilities.register_route("POST", "ping", handler).await;
            Ok(())
        })
    });

    let on_start: OrgHook = Arc::new(|context: PluginContext| {
        Box::pin(async move {
            let greeting = context
                .config
                .get("greeting")
                .and_then(|g| g.as_str())
                .unwrap_or("pong")
                .to_string();
            context
                .tools
                .register_local(
                    "echo",
                    Box::new(move |_server_context| {
                        Box::pin(async move {
                            Ok(Arc::new(EchoToolServer { greeting })
                                as Arc<dyn crate::core::mcp::ToolServerHandle>)
                        })
                    }),
                )
                .await?;
            Ok(())
        })
    });

    let on_validate_auth: ValidateAuthHook = Arc::new(|auth: AuthState| {
        Box::pin(async move {
            let present = auth
                .credentials
                .get("apiKey")
                .and_then(|k| k.as_str())
                .is_some_and(|k| !k.is_empty());
            Ok(auth.method_id == "api-key" && present)
        })
    });

    Plugin {
        manifest,
        hooks: PluginHooks {
            on_initialize: Some(on_initialize),
            on_start: Some(on_start),
            on_validate_auth: Some(on_validate_auth),
            ..PluginHooks::default()
        },
    }
}

struct EchoToolServer {
    greeting: String,
}

#[async_trait::async_trait]
impl crate::core::mcp::ToolServerHandle for EchoToolServer {
    async fn list_tools(&self) -> Result<Vec<crate::core::mcp::McpTool>> {
        Ok(vec![crate::core::mcp::McpTool {
            name: "echo".to_string(),
            description: Some("Echo the arguments back".to_string()),
            input_schema: serde_json::json!({ "type": "object" }),
        }])
    }

    async fn call_tool(&self, _name: &str, arguments: Value) -> Result<Value> {
        Ok(serde_json::json!({ "greeting": self.greeting, "echo": arguments }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plugin_fails_to_load() {
        assert!(load_plugin("does-not-exist").is_err());
    }

    #[test]
    fn builtin_plugins_pass_validation() {
        for id in builtin_manifests().keys() {
            load_plugin(id).unwrap();
        }
    }

    #[test]
    fn signature_header_requires_a_secret_key() {
        let manifest = PluginManifest {
            name: "bad".to_string(),
            version: "0.1.0".to_string(),
            description: String::new(),
            webhooks: vec![WebhookSpec {
                path: "events".to_string(),
                method: "POST".to_string(),
                signature_header: Some("X-Signature".to_string()),
                secret_key: None,
            }],
            tool_servers: Vec::new(),
        };
        assert!(validate_manifest(&manifest).is_err());
    }

    #[test]
    fn tool_server_spec_requires_id_and_command() {
        let manifest = PluginManifest {
            name: "bad".to_string(),
            version: "0.1.0".to_string(),
            description: String::new(),
            webhooks: Vec::new(),
            tool_servers: vec![ToolServerSpec {
                id: "relay".to_string(),
                command: " ".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
            }],
        };
        assert!(validate_manifest(&manifest).is_err());
    }

    #[tokio::test]
    async fn route_lookup_is_method_and_path_normalized() {
        let capabilities = CapabilityRegistry::new();
        let handler: RouteHandler = Arc::new(|_request| {
            Box::pin(async move { Ok(RouteResponse::json(serde_json::json!({}))) })
        });
        capabilities.register_route("post", "/sync", handler).await;

        assert!(capabilities.route("POST", "sync").await.is_some());
        assert!(capabilities.route("GET", "sync").await.is_none());
    }

    #[tokio::test]
    async fn descriptor_lists_routes_sorted() {
        let capabilities = CapabilityRegistry::new();
        let handler: RouteHandler = Arc::new(|_request| {
            Box::pin(async move { Ok(RouteResponse::json(serde_json::json!({}))) })
        });
        capabilities.register_route("POST", "b", handler.clone()).await;
        capabilities.register_route("GET", "a", handler).await;

        let descriptor = capabilities.descriptor().await;
        let routes = descriptor["routes"].as_array().unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0]["method"], "GET");
    }
}
