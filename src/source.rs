//! Inbound log sources feeding the forwarder.
//!
//! The docker source follows every running container through the Docker
//! API and attaches to containers started later. The stdin source reads
//! newline-delimited JSON records, which is mostly useful for piping and
//! local testing.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{ContainerInspectResponse, EventMessageTypeEnum};
use bollard::query_parameters::{
    EventsOptionsBuilder, InspectContainerOptionsBuilder, ListContainersOptionsBuilder,
    LogsOptionsBuilder,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::record::{ContainerInfo, LogRecord};

const IGNORE_ENV: &str = "LOGSPOUT=ignore";
const EXCLUDE_LABEL: &str = "logspout.exclude";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SourceKind {
    /// Follow the logs of local docker containers.
    Docker,
    /// Read newline-delimited JSON records from stdin.
    Stdin,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Feeds `tx` until the source is exhausted or shutdown is requested.
/// The channel closes once this returns and every follower has exited.
pub async fn run(
    kind: SourceKind,
    tx: mpsc::Sender<LogRecord>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), SourceError> {
    match kind {
        SourceKind::Docker => run_docker(tx, shutdown).await,
        SourceKind::Stdin => read_records(BufReader::new(tokio::io::stdin()), tx, shutdown).await,
    }
}

static DOCKER_CLIENT: OnceLock<Docker> = OnceLock::new();

fn get_docker() -> Result<&'static Docker, SourceError> {
    if let Some(docker) = DOCKER_CLIENT.get() {
        return Ok(docker);
    }
    let docker = Docker::connect_with_local_defaults()?;
    Ok(DOCKER_CLIENT.get_or_init(|| docker))
}

async fn run_docker(
    tx: mpsc::Sender<LogRecord>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SourceError> {
    let docker = get_docker()?;
    let mut followers: JoinSet<String> = JoinSet::new();
    let mut attached: HashSet<String> = HashSet::new();

    let options = ListContainersOptionsBuilder::new().all(false).build();
    for summary in docker.list_containers(Some(options)).await? {
        if let Some(id) = summary.id {
            attach(docker, &id, None, &tx, &mut followers, &mut attached).await;
        }
    }

    let mut events = docker.events(Some(EventsOptionsBuilder::new().build()));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            Some(done) = followers.join_next() => {
                if let Ok(id) = done {
                    log::debug!("Stopped following container {id}");
                    attached.remove(&id);
                }
            }
            event = events.next() => match event {
                Some(Ok(event)) => {
                    let started = event.typ == Some(EventMessageTypeEnum::CONTAINER)
                        && event.action.as_deref() == Some("start");
                    if let Some(id) = event.actor.and_then(|actor| actor.id).filter(|_| started) {
                        let since = Some(started_at(event.time));
                        attach(docker, &id, since, &tx, &mut followers, &mut attached).await;
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
    }

    followers.abort_all();
    log::info!("Docker source stopped");
    Ok(())
}

async fn attach(
    docker: &'static Docker,
    id: &str,
    since: Option<i32>,
    tx: &mpsc::Sender<LogRecord>,
    followers: &mut JoinSet<String>,
    attached: &mut HashSet<String>,
) {
    if attached.contains(id) {
        return;
    }

    let options = InspectContainerOptionsBuilder::new().build();
    let container = match docker.inspect_container(id, Some(options)).await {
        Ok(inspect) => inspect,
        Err(e) => {
            log::warn!("Failed to inspect container {id}: {e}");
            return;
        }
    };

    let Some(container) = container_info(container) else {
        log::info!("Ignoring container {id}");
        return;
    };

    log::info!("Following container {} ({})", container.name, container.id);
    attached.insert(container.id.clone());
    followers.spawn(follow(docker, container, since, tx.clone()));
}

async fn follow(
    docker: &'static Docker,
    container: ContainerInfo,
    since: Option<i32>,
    tx: mpsc::Sender<LogRecord>,
) -> String {
    let options = LogsOptionsBuilder::new()
        .follow(true)
        .stdout(true)
        .stderr(true)
        .timestamps(true);
    // Containers running at startup only forward new lines. Started ones
    // forward from their start, not the history of earlier runs.
    let options = match since {
        Some(since) => options.tail("all").since(since),
        None => options.tail("0"),
    }
    .build();
    let id = container.id.clone();
    let mut stream = std::pin::pin!(docker.logs(&id, Some(options)));

    while let Some(output) = stream.next().await {
        let (source, message) = match output {
            Ok(LogOutput::StdErr { message }) => ("stderr", message),
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                ("stdout", message)
            }
            Ok(LogOutput::StdIn { .. }) => continue,
            Err(e) => {
                log::warn!("Log stream for container {id} failed: {e}");
                break;
            }
        };

        for line in String::from_utf8_lossy(&message).lines() {
            let (time, payload) = split_timestamp(line);
            let record = LogRecord {
                container: container.clone(),
                payload: payload.to_string(),
                time,
                source: source.to_string(),
            };
            if tx.send(record).await.is_err() {
                return container.id;
            }
        }
    }

    container.id
}

/// Unix seconds of a start event, or now when the daemon did not say.
fn started_at(event_time: Option<i64>) -> i32 {
    let seconds = event_time.unwrap_or_else(|| Utc::now().timestamp());
    i32::try_from(seconds).unwrap_or(i32::MAX)
}

/// Maps an inspected container, or `None` when it opted out of forwarding.
fn container_info(inspect: ContainerInspectResponse) -> Option<ContainerInfo> {
    let config = inspect.config.unwrap_or_default();
    let env = config.env.unwrap_or_default();
    let labels = config.labels.unwrap_or_default();
    if is_ignored(&env, &labels) {
        return None;
    }

    Some(ContainerInfo {
        id: inspect.id.unwrap_or_default(),
        name: inspect.name.unwrap_or_default(),
        hostname: config.hostname.unwrap_or_default(),
        labels,
    })
}

fn is_ignored(env: &[String], labels: &HashMap<String, String>) -> bool {
    env.iter().any(|var| var == IGNORE_ENV)
        || labels
            .get(EXCLUDE_LABEL)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

/// Docker prefixes each line with an RFC 3339 timestamp when asked to.
/// Lines without one are stamped with the current time.
fn split_timestamp(line: &str) -> (DateTime<Utc>, &str) {
    line.split_once(' ')
        .and_then(|(stamp, rest)| {
            DateTime::parse_from_rfc3339(stamp)
                .ok()
                .map(|time| (time.with_timezone(&Utc), rest))
        })
        .unwrap_or_else(|| (Utc::now(), line))
}

async fn read_records<R: AsyncBufRead + Unpin>(
    reader: R,
    tx: mpsc::Sender<LogRecord>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SourceError> {
    let mut lines = reader.lines();
    let mut line_number = 0usize;

    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        line_number += 1;

        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(&line) {
            Ok(record) => {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("Skipping malformed record on line {line_number}: {e}"),
        }
    }

    Ok(())
}
