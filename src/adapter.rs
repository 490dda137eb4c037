//! Adapter construction, selected by the route scheme.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::client::FluentClient;
use crate::config::{ConfigError, Route, Settings};
use crate::connection::ConnectionManager;
use crate::encoder::Encoder;
use crate::forwarder::Forwarder;
use crate::sink::{RawSink, RecordSink};
use crate::transport;

type SinkFactory = for<'a> fn(
    &'a Route,
    &'a Settings,
    watch::Receiver<bool>,
) -> BoxFuture<'a, Result<Box<dyn RecordSink>, ConfigError>>;

/// Adapter names and the sinks they build. `fluentd` is the canonical
/// raw-socket adapter; `fluentd-forwarder` delegates to the fluent client.
const ADAPTERS: &[(&str, SinkFactory)] = &[
    ("fluentd", raw_factory),
    ("fluentd-forwarder", client_factory),
];

fn raw_factory<'a>(
    route: &'a Route,
    settings: &'a Settings,
    shutdown: watch::Receiver<bool>,
) -> BoxFuture<'a, Result<Box<dyn RecordSink>, ConfigError>> {
    raw_sink(route, settings, shutdown).boxed()
}

fn client_factory<'a>(
    route: &'a Route,
    settings: &'a Settings,
    shutdown: watch::Receiver<bool>,
) -> BoxFuture<'a, Result<Box<dyn RecordSink>, ConfigError>> {
    client_sink(route, settings, shutdown).boxed()
}

pub fn adapter_names() -> impl Iterator<Item = &'static str> {
    ADAPTERS.iter().map(|(name, _)| *name)
}

fn lookup(name: &str) -> Option<SinkFactory> {
    ADAPTERS
        .iter()
        .find(|(adapter, _)| *adapter == name)
        .map(|(_, factory)| *factory)
}

/// Builds the forwarder for `route`. Any failure here is fatal for the
/// adapter; nothing is retried.
pub async fn new_adapter(
    route: &Route,
    settings: &Settings,
    shutdown: watch::Receiver<bool>,
) -> Result<Forwarder, ConfigError> {
    let Some(factory) = lookup(&route.adapter) else {
        log::error!(
            "Available adapters: {}",
            adapter_names().collect::<Vec<_>>().join(", ")
        );
        return Err(ConfigError::UnknownAdapter(route.adapter.clone()));
    };
    let sink = factory(route, settings, shutdown).await?;
    Ok(Forwarder::new(
        route.adapter.clone(),
        settings.tags.clone(),
        sink,
    ))
}

async fn raw_sink(
    route: &Route,
    settings: &Settings,
    shutdown: watch::Receiver<bool>,
) -> Result<Box<dyn RecordSink>, ConfigError> {
    let name = route.adapter_transport(transport::DEFAULT_TRANSPORT);
    let transport =
        transport::lookup(name).ok_or_else(|| ConfigError::UnknownTransport(name.to_string()))?;
    if name != "unix" {
        route.host_port()?;
    }

    let manager = ConnectionManager::connect(
        transport,
        route.address.clone(),
        route.options.clone(),
        shutdown,
    )
    .await?
    .with_retry_policy(settings.retry)
    .with_reconnect_policy(settings.reconnect)
    .with_write_timeout(settings.client.write_timeout);

    let encoder = Encoder::new(settings.format(), settings.client.sub_second_precision);
    Ok(Box::new(RawSink::new(encoder, manager)))
}

async fn client_sink(
    route: &Route,
    settings: &Settings,
    shutdown: watch::Receiver<bool>,
) -> Result<Box<dyn RecordSink>, ConfigError> {
    let config = settings.client_config(route)?;
    let client = FluentClient::new(config, shutdown).await?;
    Ok(Box::new(client))
}
