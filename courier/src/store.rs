//! Template store: lookup by (name, locale) with not-found as a non-event.

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::{Client, Collection};
use thiserror::Error;

use courier_common::config::TemplateStoreConfig;
use courier_mail::{Locale, StoredTemplate};

/// A failed lookup. Not-found is not a failure; this covers transport and
/// document decoding trouble, both of which warrant a redelivery.
#[derive(Debug, Error)]
#[error("template store error: {0}")]
pub struct StoreError(pub String);

/// Key→template lookup the dispatcher resolves against.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Fetch the template for `(name, locale)`; `Ok(None)` when absent.
    async fn resolve(&self, name: &str, locale: Locale)
        -> Result<Option<StoredTemplate>, StoreError>;
}

/// MongoDB-backed template store.
pub struct MongoTemplateStore {
    templates: Collection<StoredTemplate>,
}

impl MongoTemplateStore {
    /// Connect and bind the `templates` collection.
    ///
    /// # Errors
    ///
    /// Returns the driver's connection error.
    pub async fn connect(config: &TemplateStoreConfig) -> Result<Self, mongodb::error::Error> {
        let client = Client::with_uri_str(&config.url).await?;
        Ok(Self {
            templates: client.database(&config.database).collection("templates"),
        })
    }
}

#[async_trait]
impl TemplateStore for MongoTemplateStore {
    async fn resolve(
        &self,
        name: &str,
        locale: Locale,
    ) -> Result<Option<StoredTemplate>, StoreError> {
        self.templates
            .find_one(doc! { "Name": name, "Locale": locale.as_str() })
            .await
            .map_err(|err| StoreError(err.to_string()))
    }
}
