//! Tenant to connection resolution

use chunkstore_core::{ConnectionInfo, MilvusConfig, Result, StoreConfig, TenantOverride};
use std::collections::HashMap;

/// Maps a tenant (source) id to backend connection parameters
pub trait TenantResolver: Send + Sync {
    fn resolve(&self, tenant_id: &str) -> Result<ConnectionInfo>;
}

/// Resolves tenants from configuration: the default Milvus connection,
/// with per-tenant overrides applied on top
#[derive(Debug, Clone)]
pub struct ConfigTenantResolver {
    defaults: MilvusConfig,
    tenants: HashMap<String, TenantOverride>,
}

impl ConfigTenantResolver {
    pub fn new(defaults: MilvusConfig, tenants: HashMap<String, TenantOverride>) -> Self {
        Self { defaults, tenants }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.milvus.clone(), config.tenants.clone())
    }
}

impl TenantResolver for ConfigTenantResolver {
    fn resolve(&self, tenant_id: &str) -> Result<ConnectionInfo> {
        let tenant = self.tenants.get(tenant_id).cloned().unwrap_or_default();
        let defaults = &self.defaults;

        let user = tenant.user.or_else(|| defaults.user.clone());
        let password = tenant.password.or_else(|| defaults.password.clone());

        let mut info = ConnectionInfo::new(
            tenant.host.unwrap_or_else(|| defaults.host.clone()),
            tenant.port.unwrap_or(defaults.port),
            tenant.db_name.unwrap_or_else(|| defaults.db_name.clone()),
            tenant
                .collection_name
                .unwrap_or_else(|| defaults.collection_name.clone()),
        )
        .with_credentials(user, password);

        if let Some(secure) = defaults.secure {
            info.secure = secure;
        }

        Ok(info)
    }
}
