//! Request dispatch
//!
//! Every keyed request runs PermissionGate, then KeyStore, then
//! AlgorithmRegistry, then OperationEngine. `ping` touches none of them.

use std::collections::HashMap;
use std::sync::Arc;

use custody_crypto::{AlgorithmRegistry, CryptoError, KeyMaterial, OperationEngine, Outcome};
use log::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{BrokerError, Result};
use crate::keystore::{KeyStore, KeyVersion, VersionSelector};
use crate::permission::{Action, CallerIdentity, Capability, PermissionGate};
use crate::protocol::{Operation, Request, Response, ResponseBody};

/// Log target for grant and deny decisions
pub const AUDIT_TARGET: &str = "custody::audit";

/// Upper bound on cached grants per connection
const MAX_CACHED_CAPABILITIES: usize = 256;

/// Per-connection state owned by the connection task
#[derive(Debug)]
pub struct ConnectionContext {
    id: u64,
    caller: Option<CallerIdentity>,
    // Granted capabilities only, kept for the connection's lifetime
    capabilities: HashMap<String, Capability>,
}

impl ConnectionContext {
    pub fn new(id: u64, caller: Option<CallerIdentity>) -> Self {
        Self {
            id,
            caller,
            capabilities: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn caller(&self) -> Option<&CallerIdentity> {
        self.caller.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.caller.is_some()
    }
}

/// The broker core, shared by every connection
pub struct Broker {
    store: Arc<dyn KeyStore>,
    gate: Arc<dyn PermissionGate>,
    registry: AlgorithmRegistry,
    engine: OperationEngine,
}

impl Broker {
    pub fn new(
        store: Arc<dyn KeyStore>,
        gate: Arc<dyn PermissionGate>,
        registry: AlgorithmRegistry,
    ) -> Self {
        Self {
            store,
            gate,
            registry,
            engine: OperationEngine::new(),
        }
    }

    pub fn registry(&self) -> &AlgorithmRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    /// Serve one request. Failures become error responses; nothing here
    /// closes the connection.
    pub async fn handle(&self, ctx: &mut ConnectionContext, mut request: Request) -> Response {
        let operation = request.operation;
        match self.dispatch(ctx, &mut request).await {
            Ok(body) => Response::ok(body),
            Err(err) => {
                if operation != Operation::Ping {
                    let caller = ctx
                        .caller()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "unauthenticated".to_string());
                    warn!(
                        target: AUDIT_TARGET,
                        "conn#{} {} {} {} {}: {}",
                        ctx.id(),
                        caller,
                        operation,
                        request.set_name,
                        VersionSelector::from(request.version),
                        err
                    );
                }
                Response::from_error(&err)
            }
        }
    }

    async fn dispatch(&self, ctx: &mut ConnectionContext, request: &mut Request) -> Result<ResponseBody> {
        if request.operation == Operation::Ping {
            debug!("conn#{} ping", ctx.id());
            return Ok(ResponseBody::Bool(true));
        }

        let caller = *ctx
            .caller()
            .ok_or_else(|| BrokerError::Denied("connection is not authenticated".to_string()))?;
        if request.set_name.is_empty() {
            return Err(BrokerError::Malformed(format!(
                "{} request without a key set name",
                request.operation
            )));
        }

        let action = match request.operation {
            Operation::Retrieve => Action::Retrieve,
            _ => Action::Operate,
        };
        let capability = self.authorize(ctx, &caller, &request.set_name, action)?;

        let key = self.store.get(&request.set_name, request.version)?;
        info!(
            target: AUDIT_TARGET,
            "conn#{} {} {} {} v{} granted ({:?})",
            ctx.id(),
            caller,
            request.operation,
            request.set_name,
            key.version(),
            capability
        );

        match request.operation.engine_kind() {
            Some(kind) => {
                let primitive = self.registry.resolve_optional(kind, request.algorithm)?;
                let payload = Zeroizing::new(std::mem::take(&mut request.payload));
                let aux = request.aux_payload.take().map(Zeroizing::new);
                if request.operation == Operation::Verify && aux.is_none() {
                    return Err(BrokerError::Malformed("verify request without a signature".to_string()));
                }

                let engine = self.engine;
                let outcome = tokio::task::spawn_blocking(move || {
                    engine.perform(kind, primitive, key.material(), &payload, aux.as_ref().map(|a| a.as_slice()))
                })
                .await
                .map_err(|e| CryptoError::AlgorithmFailure(format!("engine task failed: {}", e)))??;

                Ok(match outcome {
                    Outcome::Bytes(bytes) => ResponseBody::Bytes(bytes),
                    Outcome::Verified(valid) => ResponseBody::Bool(valid),
                })
            }
            None => retrieve(&key),
        }
    }

    fn authorize(
        &self,
        ctx: &mut ConnectionContext,
        caller: &CallerIdentity,
        set: &str,
        action: Action,
    ) -> Result<Capability> {
        let capability = match ctx.capabilities.get(set) {
            Some(cached) => Some(*cached),
            None => {
                let fresh = self.gate.capability(caller, set);
                if let Some(granted) = fresh {
                    if ctx.capabilities.len() < MAX_CACHED_CAPABILITIES {
                        ctx.capabilities.insert(set.to_string(), granted);
                    }
                }
                fresh
            }
        };

        match capability {
            Some(capability) if capability.permits(action) => Ok(capability),
            _ => Err(BrokerError::Denied(format!(
                "{} may not {} key set {}",
                caller, action, set
            ))),
        }
    }
}

fn retrieve(key: &KeyVersion) -> Result<ResponseBody> {
    Ok(match key.material() {
        KeyMaterial::Symmetric(secret) => ResponseBody::SymmetricKey {
            version: key.version(),
            secret: secret.expose().to_vec(),
        },
        KeyMaterial::Asymmetric(pair) => ResponseBody::KeyPair {
            version: key.version(),
            public_der: pair.public_der()?,
            private_der: pair.private_der()?.to_vec(),
        },
    })
}
