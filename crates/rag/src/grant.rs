use tracing::{error, info};

use crate::catalog::Catalog;

#[derive(Clone)]
pub struct AccessGrantResolver {
    catalog: Catalog,
}

impl AccessGrantResolver {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    pub fn grant(&self, doc_id: &str, principal_id: &str) -> bool {
        match self.catalog.add_authorized_user(doc_id, principal_id) {
            Ok(users) => {
                info!(doc_id, user = principal_id, authorized = users.len(), "access granted");
                true
            }
            Err(err) => {
                error!(doc_id, user = principal_id, error = %err, "access grant failed");
                false
            }
        }
    }
}
