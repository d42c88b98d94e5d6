//! API-wide settings.

use derivative::Derivative;

/// Settings shared by every resource served by an [`Api`](crate::api::Api).
#[derive(Clone, Debug, Derivative, PartialEq, Eq)]
#[derivative(Default)]
pub struct ApiConfig {
    /// Prefix of every resource path, such as `/api`.
    #[derivative(Default(value = "\"/api\".into()"))]
    pub base_uri: String,

    /// Query parameter selecting a page of a paged collection. Pages are numbered from 0.
    #[derivative(Default(value = "\"page\".into()"))]
    pub page_param: String,

    /// Internal name of the key under which a resource reports its own address. Like every
    /// other key it is passed through the formatter, so the default appears as `resourceUri`.
    #[derivative(Default(value = "\"resource_uri\".into()"))]
    pub resource_uri_key: String,

    /// Key under which a collection member without an address reports its primary key. This
    /// key is emitted verbatim.
    #[derivative(Default(value = "\"_id\".into()"))]
    pub surrogate_key: String,

    /// Page size of collections which don't set their own.
    pub default_page_size: Option<usize>,
}

impl ApiConfig {
    pub fn with_base_uri(mut self, base_uri: impl Into<String>) -> Self {
        self.base_uri = base_uri.into();
        self
    }

    pub fn with_default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = Some(size);
        self
    }

    /// The base URI without a trailing slash.
    pub fn base(&self) -> &str {
        self.base_uri.trim_end_matches('/')
    }
}
