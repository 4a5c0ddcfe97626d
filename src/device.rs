//! Long-lived handle to one managed switch
//!
//! A [`Device`] owns the CoAP client and the model loaded from the catalog
//! the device reports. All datastore operations go through it.

use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::catalog::CatalogManager;
use crate::client::{CoapClient, DATASTORE_PATH};
use crate::coap_types::{ContentFormat, QueryParams};
use crate::config::{Config, SortMode};
use crate::coreconf::{CoreconfModel, OutputFormat};
use crate::error::{CoreconfError, Result};
use crate::request_builder::RequestBuilder;
use crate::transport::Transport;

#[derive(Debug)]
pub struct Device {
    client: CoapClient,
    model: CoreconfModel,
    sort_mode: SortMode,
    checksum: Option<String>,
}

impl Device {
    /// Connect, wait for the announce frame and load the device's catalog
    #[instrument(skip_all, fields(target = %config.transport.target.describe()))]
    pub async fn open(config: Config) -> Result<Self> {
        let catalogs = CatalogManager::new(&config.catalog)?;
        let ready_timeout = config.transport.ready_timeout_ms;

        let transport = Transport::new(config.transport);
        transport.connect().await?;
        transport
            .wait_for_ready(std::time::Duration::from_millis(ready_timeout))
            .await?;
        let client = CoapClient::new(transport, config.codec.block_szx);

        let checksum = catalogs.query_checksum_from_device(&client).await?;
        let dir = catalogs.download_catalog(&checksum).await?;

        let compiler = config.codec.yang_compiler.clone();
        let model = tokio::task::spawn_blocking(move || CoreconfModel::from_catalog(dir, &compiler))
            .await
            .map_err(|e| CoreconfError::Schema(format!("model loading aborted: {e}")))??;
        info!(checksum = %checksum, sids = model.sids().len(), "device ready");

        Ok(Self {
            client,
            model,
            sort_mode: config.codec.sort_mode,
            checksum: Some(checksum),
        })
    }

    /// Wrap an already connected client and a loaded model
    pub fn from_parts(client: CoapClient, model: CoreconfModel, sort_mode: SortMode) -> Self {
        Self {
            client,
            model,
            sort_mode,
            checksum: None,
        }
    }

    pub fn model(&self) -> &CoreconfModel {
        &self.model
    }

    pub fn client(&self) -> &CoapClient {
        &self.client
    }

    /// Catalog checksum reported by the device, if opened through [`Device::open`]
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    fn builder(&self) -> RequestBuilder<'_> {
        RequestBuilder::new(&self.model, self.sort_mode)
    }

    /// Read the whole datastore with a block-wise GET
    pub async fn get_datastore(&self, query: QueryParams, format: OutputFormat) -> Result<Value> {
        let body = self
            .client
            .send_blockwise_get(DATASTORE_PATH, query, ContentFormat::YangDataCborSid)
            .await?;
        debug!(bytes = body.len(), "datastore received");
        if body.is_empty() {
            return Ok(empty(format));
        }
        self.model.decode(&body, format)
    }

    /// Read selected nodes.
    ///
    /// `paths` is a list of instance-identifier strings or
    /// instance-identifier objects. Paths the model does not know are left
    /// out; if none remain the device is not contacted.
    pub async fn fetch(&self, paths: &Value, format: OutputFormat) -> Result<Value> {
        let queries = self.builder().build_fetch(paths)?;
        if queries.is_empty() {
            return Ok(empty(format));
        }
        let reply = self.client.send_ifetch_request(&queries).await?;
        self.model.decode_instances(&reply, format)
    }

    /// Write instance-identifier pairs or an RFC 7951 tree in one iPATCH
    pub async fn patch(&self, data: &Value) -> Result<()> {
        let instances = self.builder().build_ipatch(data)?;
        if instances.is_empty() {
            return Ok(());
        }
        self.client.send_ipatch_request(&instances).await
    }

    /// Invoke an RPC or action and decode its output
    pub async fn invoke_rpc(
        &self,
        path: &str,
        input: Option<&Value>,
        format: OutputFormat,
    ) -> Result<Value> {
        let payload = self.builder().build_post(path, input)?;
        let reply = self.client.send_post_request(DATASTORE_PATH, payload).await?;
        self.model.decode_instances(&reply, format)
    }

    /// Release the transport; pending requests fail with `ConnectionClosed`
    pub fn close(&self) {
        self.client.transport().disconnect();
    }
}

fn empty(format: OutputFormat) -> Value {
    match format {
        OutputFormat::Rfc7951 => Value::Object(Map::new()),
        OutputFormat::InstanceIdentifier => Value::Array(Vec::new()),
    }
}
