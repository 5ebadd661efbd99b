mod admin;
pub mod cache;
mod codec;
pub mod decision;
pub mod directives;
pub mod freshness;
pub mod headers;
pub mod listener;
mod pipeline;
pub mod revalidate;
mod tunnel;
mod upstream;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;

use upstream::UpstreamTransport;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Arc<dyn cache::Cache>,
    pub(crate) transport: Arc<UpstreamTransport>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, cache: Arc<dyn cache::Cache>) -> Result<Self> {
        let transport = Arc::new(UpstreamTransport::new(&settings)?);
        Ok(Self {
            settings,
            cache,
            transport,
        })
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
