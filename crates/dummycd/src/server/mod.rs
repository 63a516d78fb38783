//! Inbound control surface.
//!
//! The custom-resource controllers forward their declarations here as
//! newline-delimited JSON over TCP. Repository and application operations are
//! level-triggered and idempotent: re-declaring an existing repository or an
//! unchanged application acknowledges without error.

pub mod protocol;

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

pub use protocol::{ApplicationSummary, ControlRequest, ControlResponse};

use crate::error::EngineError;
use crate::registry::{Registry, RepositorySettings};

pub struct ControlServer {
    registry: Arc<Registry>,
    port: u16,
}

impl ControlServer {
    pub fn new(registry: Arc<Registry>, port: u16) -> Self {
        Self { registry, port }
    }

    /// Accepts connections until the shutdown channel is signalled.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!("control server listening on :{}", self.port);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("control server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(handle_connection(registry, stream));
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
            }
        }
    }
}

async fn handle_connection(registry: Arc<Registry>, stream: TcpStream) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => dispatch(&registry, request).await,
            Err(e) => ControlResponse::error(format!("invalid request: {e}")),
        };

        let mut payload = serde_json::to_vec(&response)
            .unwrap_or_else(|_| br#"{"ok":false,"error":"serialization failed"}"#.to_vec());
        payload.push(b'\n');

        if writer.write_all(&payload).await.is_err() {
            break;
        }
    }
}

async fn dispatch(registry: &Registry, request: ControlRequest) -> ControlResponse {
    debug!("request received: {request:?}");

    match request {
        ControlRequest::AddRepository {
            name,
            url,
            private_key_secret,
            insecure_ignore_host_key,
        } => {
            if registry.get_repository_config(&url).await.is_some() {
                debug!("config for url already exist {name}: {url}");
                return ControlResponse::done();
            }

            let settings = RepositorySettings {
                url: url.clone(),
                private_key_secret,
                insecure_ignore_host_key,
            };

            match registry.add_repository(&name, settings).await {
                Ok(()) => {
                    info!("repository added: {url}");
                    ControlResponse::done()
                }
                // Lost a race against an identical declaration; still converged.
                Err(EngineError::RepositoryAlreadyExists { .. }) => ControlResponse::done(),
                Err(e) => {
                    error!("{name}: {e}");
                    ControlResponse::error(e.to_string())
                }
            }
        }

        ControlRequest::DeleteRepository { name } => {
            match registry.delete_repository(&name).await {
                Ok(()) => ControlResponse::done(),
                Err(e) => {
                    error!("{name}: {e}");
                    ControlResponse::error(e.to_string())
                }
            }
        }

        ControlRequest::AddOrUpdateApplication { decl } => {
            let name = decl.name.clone();
            match registry.add_or_update_application(decl).await {
                Ok(()) => {
                    info!("application added: {name}");
                    ControlResponse::done()
                }
                Err(EngineError::AlreadyUpToDate) => {
                    debug!("application already up to date: {name}");
                    ControlResponse::done()
                }
                Err(e) => {
                    error!("{name}: {e}");
                    ControlResponse::error(e.to_string())
                }
            }
        }

        ControlRequest::DeleteApplication { name, url } => {
            match registry.delete_application(&name, &url).await {
                Ok(()) => ControlResponse::done(),
                Err(e) => {
                    error!("{name}: {e}");
                    ControlResponse::error(e.to_string())
                }
            }
        }

        ControlRequest::ListApplications => {
            let mut summaries = Vec::new();
            for app in registry.applications().await {
                let decl = app.decl();
                summaries.push(ApplicationSummary {
                    name: decl.name.clone(),
                    namespace: decl.namespace.clone(),
                    url: decl.url.clone(),
                    reference: decl.reference.clone(),
                    revision: app.current_revision().await.as_str().to_string(),
                });
            }

            match serde_json::to_value(summaries) {
                Ok(data) => ControlResponse::with_data(data),
                Err(e) => ControlResponse::error(e.to_string()),
            }
        }

        ControlRequest::GetApplicationRevisions { name, url } => {
            let Some(app) = registry.get_application(&name, &url).await else {
                return ControlResponse::error(
                    EngineError::ApplicationNotFound(name).to_string(),
                );
            };

            match app.revision_history() {
                Ok(entries) => match serde_json::to_value(entries) {
                    Ok(data) => ControlResponse::with_data(data),
                    Err(e) => ControlResponse::error(e.to_string()),
                },
                Err(e) => ControlResponse::error(e.to_string()),
            }
        }
    }
}
