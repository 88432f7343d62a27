//! Client side of the container-runtime daemon.
//!
//! Listing, stats snapshots, and the event feed go through bollard. The log
//! endpoint is read directly over the daemon's unix socket instead, so the
//! relay owns the multiplexed stream framing (see [`crate::demux`]) and the
//! exact `since` cursor semantics.

use std::collections::HashMap;

use bollard::models::EventMessage;
use bollard::query_parameters::{EventsOptionsBuilder, ListContainersOptions, StatsOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream};
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::demux::MuxFrameDecoder;

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// A running container as seen by a discovery sweep.
pub(crate) struct DiscoveredContainer {
    pub id: String,
    pub labels: HashMap<String, String>,
}

pub(crate) type LogFrameStream = FramedRead<
    StreamReader<BoxStream<'static, std::io::Result<Bytes>>, Bytes>,
    MuxFrameDecoder,
>;

#[derive(Clone)]
pub(crate) struct DockerRuntime {
    docker: Docker,
    socket_path: String,
}

impl DockerRuntime {
    pub(crate) async fn connect() -> anyhow::Result<Self> {
        let socket_path = resolve_socket_path();
        let docker = Docker::connect_with_unix(&socket_path, 120, API_DEFAULT_VERSION)?;
        tracing::info!("connected to Docker {:?}", docker.version().await?.version);
        Ok(Self {
            docker,
            socket_path,
        })
    }

    /// Running containers only. A listing failure is transient; callers get
    /// an empty sweep and try again on the next tick.
    pub(crate) async fn list_containers(&self) -> Vec<DiscoveredContainer> {
        let options = ListContainersOptions {
            all: false,
            limit: None,
            size: false,
            filters: None,
        };
        match self.docker.list_containers(Some(options)).await {
            Ok(containers) => containers
                .into_iter()
                .filter_map(|c| {
                    Some(DiscoveredContainer {
                        id: c.id?,
                        labels: c.labels.unwrap_or_default(),
                    })
                })
                .collect(),
            Err(e) => {
                tracing::warn!("failed to list containers: {e}");
                Vec::new()
            }
        }
    }

    /// One instantaneous stats document, or `None` when the daemon has
    /// nothing usable for this container right now.
    pub(crate) async fn stats_snapshot(&self, id: &str) -> Option<serde_json::Value> {
        let mut stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        match stream.next().await {
            Some(Ok(stats)) => serde_json::to_value(&stats).ok(),
            Some(Err(e)) => {
                tracing::debug!("failed to fetch stats for container {id}: {e}");
                None
            }
            None => {
                tracing::debug!("no stats returned for container {id}");
                None
            }
        }
    }

    pub(crate) fn event_stream(
        &self,
    ) -> impl Stream<Item = Result<EventMessage, bollard::errors::Error>> + Unpin + '_ {
        self.docker.events(Some(EventsOptionsBuilder::new().build()))
    }

    /// Tails the container's combined stdout/stderr from `since` (unix
    /// seconds), yielding demultiplexed payload chunks.
    pub(crate) async fn attach_logs(&self, id: &str, since: i64) -> anyhow::Result<LogFrameStream> {
        let socket = UnixStream::connect(&self.socket_path).await?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(socket)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("log attach connection error: {e}");
            }
        });

        let uri = format!(
            "/containers/{id}/logs?follow=true&stdout=true&stderr=true&timestamps=true&since={since}"
        );
        let request = Request::get(uri)
            .header(hyper::header::HOST, "docker")
            .body(Empty::<Bytes>::new())?;

        let response = sender.send_request(request).await?;
        if !response.status().is_success() {
            anyhow::bail!("daemon returned {} for log attach", response.status());
        }

        let body: BoxStream<'static, std::io::Result<Bytes>> = response
            .into_body()
            .into_data_stream()
            .map_err(std::io::Error::other)
            .boxed();
        Ok(FramedRead::new(StreamReader::new(body), MuxFrameDecoder))
    }
}

fn resolve_socket_path() -> String {
    if let Ok(host) = std::env::var("DOCKER_HOST") {
        if let Some(path) = host.strip_prefix("unix://") {
            return path.to_owned();
        }
    }
    if std::path::Path::new(DEFAULT_SOCKET).exists() {
        return DEFAULT_SOCKET.to_owned();
    }
    // Docker Desktop keeps the socket under the user's home
    match std::env::var("HOME") {
        Ok(home) => format!("{home}/.docker/desktop/docker.sock"),
        Err(_) => DEFAULT_SOCKET.to_owned(),
    }
}
