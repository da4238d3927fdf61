//! State-of-the-world xDS discovery services backed by a [SnapshotCache].
//!
//! Every stream is handled by its own task. The protocol state of a stream
//! lives in a [StreamState], which turns incoming requests into cache watches
//! and watch responses into outgoing `DiscoveryResponse`s without doing any
//! io itself. [run_stream] is the loop that feeds it.

use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use enum_map::EnumMap;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream, UnixListenerStream};
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};
use xds_api::pb::envoy::{
    config::core::v3 as xds_core,
    service::{
        cluster::v3::cluster_discovery_service_server::{
            ClusterDiscoveryService, ClusterDiscoveryServiceServer,
        },
        discovery::v3::{
            aggregated_discovery_service_server::{
                AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
            },
            DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
        },
        endpoint::v3::endpoint_discovery_service_server::{
            EndpointDiscoveryService, EndpointDiscoveryServiceServer,
        },
        listener::v3::listener_discovery_service_server::{
            ListenerDiscoveryService, ListenerDiscoveryServiceServer,
        },
        route::v3::route_discovery_service_server::{
            RouteDiscoveryService, RouteDiscoveryServiceServer,
        },
    },
};

use crate::config::ListenAddress;
use crate::error::Result;

use super::cache::{node_key, FetchError, SnapshotCache, WatchId, WatchResponse};
use super::ResourceType;

const MAX_CONCURRENT_STREAMS: u32 = 1_000_000;

const SERVICE_NAMES: &[&str] = &[
    "envoy.service.discovery.v3.AggregatedDiscoveryService",
    "envoy.service.cluster.v3.ClusterDiscoveryService",
    "envoy.service.endpoint.v3.EndpointDiscoveryService",
    "envoy.service.listener.v3.ListenerDiscoveryService",
    "envoy.service.route.v3.RouteDiscoveryService",
];

macro_rules! log_request {
    ($stream_id:expr, $request:expr) => {
        tracing::debug!(
            stream_id = $stream_id,
            nack = $request.error_detail.is_some(),
            "DiscoveryRequest(v={:?}, n={:?}, ty={:?}, r={:?})",
            $request.version_info,
            $request.response_nonce,
            $request.type_url,
            $request.resource_names,
        );
    };
}

macro_rules! log_response {
    ($stream_id:expr, $response:expr, $names:expr) => {
        tracing::debug!(
            stream_id = $stream_id,
            "DiscoveryResponse(v={:?}, n={:?}, ty={:?}, r={:?})",
            $response.version_info,
            $response.nonce,
            $response.type_url,
            $names,
        );
    };
}

/// Serve the xDS discovery services until `shutdown` is cancelled.
pub async fn serve(
    cache: Arc<SnapshotCache>,
    address: ListenAddress,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(xds_api::FILE_DESCRIPTOR_SET);
    for name in SERVICE_NAMES {
        reflection = reflection.with_service_name(*name);
    }
    let reflection = reflection.build()?;

    let server = Server::new(cache, shutdown.clone());
    let router = tonic::transport::Server::builder()
        .max_concurrent_streams(MAX_CONCURRENT_STREAMS)
        .add_service(reflection)
        .add_service(AggregatedDiscoveryServiceServer::new(server.clone()))
        .add_service(ClusterDiscoveryServiceServer::new(server.clone()))
        .add_service(EndpointDiscoveryServiceServer::new(server.clone()))
        .add_service(ListenerDiscoveryServiceServer::new(server.clone()))
        .add_service(RouteDiscoveryServiceServer::new(server));

    match address {
        ListenAddress::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(address = %addr, "listening for xDS clients");
            router
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    shutdown.cancelled(),
                )
                .await?;
        }
        ListenAddress::Unix(path) => {
            let listener = tokio::net::UnixListener::bind(&path)?;
            info!(address = %path.display(), "listening for xDS clients");
            router
                .serve_with_incoming_shutdown(
                    UnixListenerStream::new(listener),
                    shutdown.cancelled(),
                )
                .await?;
        }
    }

    info!("xDS server shut down");
    Ok(())
}

/// The discovery services. Clones share a cache and a stream id counter.
///
/// Open streams are closed when `shutdown` is cancelled.
#[derive(Clone)]
pub struct Server {
    cache: Arc<SnapshotCache>,
    next_stream_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

type DiscoveryResponseStream =
    Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;

type DeltaDiscoveryResponseStream =
    Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

impl Server {
    pub fn new(cache: Arc<SnapshotCache>, shutdown: CancellationToken) -> Self {
        Self {
            cache,
            next_stream_id: Arc::new(AtomicU64::new(1)),
            shutdown,
        }
    }

    fn stream(
        &self,
        requests: Streaming<DiscoveryRequest>,
        default_type: Option<ResourceType>,
    ) -> Response<DiscoveryResponseStream> {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(16);

        let state = StreamState::new(self.cache.clone(), stream_id, default_type);
        let shutdown = self.shutdown.clone();
        tokio::spawn(run_stream(state, requests, tx, shutdown));

        Response::new(Box::pin(ReceiverStream::new(rx)))
    }

    fn fetch(
        &self,
        request: Request<DiscoveryRequest>,
        resource_type: ResourceType,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        let mut request = request.into_inner();
        if request.type_url.is_empty() {
            request.type_url = resource_type.type_url().to_string();
        }
        if request.type_url != resource_type.type_url() {
            return Err(Status::invalid_argument(format!(
                "unexpected type_url {:?}",
                request.type_url
            )));
        }

        match self.cache.fetch(resource_type, &request) {
            Ok(response) => Ok(Response::new(response.to_discovery_response(String::new()))),
            Err(e @ FetchError::UpToDate) => Err(Status::unavailable(e.to_string())),
            Err(e @ FetchError::MissingSnapshot(_)) => Err(Status::not_found(e.to_string())),
        }
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for Server {
    type StreamAggregatedResourcesStream = DiscoveryResponseStream;
    type DeltaAggregatedResourcesStream = DeltaDiscoveryResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(self.stream(request.into_inner(), None))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }
}

macro_rules! impl_discovery_service {
    (
        $service:ident,
        $resource_type:expr,
        $stream_ty:ident => $stream_fn:ident,
        $delta_ty:ident => $delta_fn:ident,
        $fetch_fn:ident$(,)?
    ) => {
        #[tonic::async_trait]
        impl $service for Server {
            type $stream_ty = DiscoveryResponseStream;
            type $delta_ty = DeltaDiscoveryResponseStream;

            async fn $stream_fn(
                &self,
                request: Request<Streaming<DiscoveryRequest>>,
            ) -> std::result::Result<Response<Self::$stream_ty>, Status> {
                Ok(self.stream(request.into_inner(), Some($resource_type)))
            }

            async fn $delta_fn(
                &self,
                _request: Request<Streaming<DeltaDiscoveryRequest>>,
            ) -> std::result::Result<Response<Self::$delta_ty>, Status> {
                Err(Status::unimplemented("delta xDS is not supported"))
            }

            async fn $fetch_fn(
                &self,
                request: Request<DiscoveryRequest>,
            ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
                self.fetch(request, $resource_type)
            }
        }
    };
}

impl_discovery_service!(
    ClusterDiscoveryService,
    ResourceType::Cluster,
    StreamClustersStream => stream_clusters,
    DeltaClustersStream => delta_clusters,
    fetch_clusters,
);

impl_discovery_service!(
    EndpointDiscoveryService,
    ResourceType::Endpoint,
    StreamEndpointsStream => stream_endpoints,
    DeltaEndpointsStream => delta_endpoints,
    fetch_endpoints,
);

impl_discovery_service!(
    ListenerDiscoveryService,
    ResourceType::Listener,
    StreamListenersStream => stream_listeners,
    DeltaListenersStream => delta_listeners,
    fetch_listeners,
);

impl_discovery_service!(
    RouteDiscoveryService,
    ResourceType::Route,
    StreamRoutesStream => stream_routes,
    DeltaRoutesStream => delta_routes,
    fetch_routes,
);

#[derive(Debug, Default)]
struct TypeState {
    // the nonce of the last response sent for this type
    nonce: String,
    watch: Option<WatchId>,
}

/// The protocol state of a single SotW stream.
///
/// A stream only opens a new watch for a type when a request acknowledges the
/// last response sent for that type. Requests with any other nonce are stale
/// and get dropped. Opening a watch always cancels the previous one for the
/// same type.
pub(crate) struct StreamState {
    cache: Arc<SnapshotCache>,
    stream_id: u64,
    default_type: Option<ResourceType>,
    node: Option<xds_core::Node>,
    nonce: u64,
    types: EnumMap<ResourceType, TypeState>,
}

impl StreamState {
    pub(crate) fn new(
        cache: Arc<SnapshotCache>,
        stream_id: u64,
        default_type: Option<ResourceType>,
    ) -> Self {
        Self {
            cache,
            stream_id,
            default_type,
            node: None,
            nonce: 0,
            types: Default::default(),
        }
    }

    fn node_key(&self) -> &str {
        node_key(self.node.as_ref())
    }

    /// Handle an incoming request, returning the channel a response will
    /// arrive on if the request opened a new watch.
    pub(crate) fn handle_request(
        &mut self,
        mut request: DiscoveryRequest,
    ) -> std::result::Result<Option<(ResourceType, mpsc::Receiver<WatchResponse>)>, Status> {
        log_request!(self.stream_id, request);

        // only the first request on a stream has to carry the node
        match &request.node {
            Some(node) => self.node = Some(node.clone()),
            None => request.node = self.node.clone(),
        }

        if request.type_url.is_empty() {
            match self.default_type {
                Some(rtype) => request.type_url = rtype.type_url().to_string(),
                None => return Err(Status::invalid_argument("type URL is required for ADS")),
            }
        }

        let Some(resource_type) = ResourceType::from_type_url(&request.type_url) else {
            debug!(
                stream_id = self.stream_id,
                type_url = %request.type_url,
                "ignoring request for unknown type"
            );
            return Ok(None);
        };

        let state = &self.types[resource_type];
        if !(state.nonce.is_empty() || state.nonce == request.response_nonce) {
            debug!(
                stream_id = self.stream_id,
                type_url = %request.type_url,
                nonce = %request.response_nonce,
                expected = %state.nonce,
                "ignoring stale request"
            );
            return Ok(None);
        }

        if let Some(id) = self.types[resource_type].watch.take() {
            self.cache.cancel_watch(self.node_key(), id);
        }

        let (rx, watch) = self.cache.create_watch(resource_type, &request);
        self.types[resource_type].watch = watch;
        Ok(Some((resource_type, rx)))
    }

    /// Turn a watch response into the next response on this stream.
    pub(crate) fn handle_response(&mut self, response: WatchResponse) -> DiscoveryResponse {
        self.nonce += 1;
        let nonce = self.nonce.to_string();

        let state = &mut self.types[response.resource_type];
        state.nonce = nonce.clone();
        state.watch = None;

        let discovery_response = response.to_discovery_response(nonce);
        log_response!(self.stream_id, discovery_response, response.resource_names());
        discovery_response
    }

    /// Cancel every watch this stream has open.
    pub(crate) fn close(&mut self) {
        let node = node_key(self.node.as_ref()).to_string();
        for (_, state) in self.types.iter_mut() {
            if let Some(id) = state.watch.take() {
                self.cache.cancel_watch(&node, id);
            }
        }
    }
}

/// Drive a single stream until either end goes away or `shutdown` is
/// cancelled. Any watches the stream holds are cancelled on the way out.
pub(crate) async fn run_stream<S>(
    mut state: StreamState,
    mut requests: S,
    tx: mpsc::Sender<std::result::Result<DiscoveryResponse, Status>>,
    shutdown: CancellationToken,
) where
    S: Stream<Item = std::result::Result<DiscoveryRequest, Status>> + Unpin,
{
    debug!(stream_id = state.stream_id, "stream open");
    let mut responses: StreamMap<ResourceType, ReceiverStream<WatchResponse>> = StreamMap::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!(stream_id = state.stream_id, "closing stream for shutdown");
                break;
            }
            _ = tx.closed() => break,
            Some((_, response)) = responses.next() => {
                let response = state.handle_response(response);
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
            request = requests.next() => {
                let request = match request {
                    Some(Ok(request)) => request,
                    Some(Err(status)) => {
                        let is_broken_pipe =
                            unwrap_io_error(&status).is_some_and(|e| e.kind() == ErrorKind::BrokenPipe);
                        if !is_broken_pipe {
                            debug!(stream_id = state.stream_id, err = %status, "stream closed unexpectedly");
                        }
                        break;
                    }
                    None => break,
                };

                match state.handle_request(request) {
                    Ok(Some((resource_type, rx))) => {
                        // replacing the old receiver drops any response that
                        // raced with the new request
                        responses.insert(resource_type, ReceiverStream::new(rx));
                    }
                    Ok(None) => (),
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }
            }
        }
    }

    state.close();
    debug!(stream_id = state.stream_id, "stream closed");
}

/// Returns the [std::io::Error] underneath a tonic [Status], if there is one.
///
/// Adapted from the `tonic` examples.
///
/// https://github.com/hyperium/tonic/blob/941726cc46b995dcc393c9d2b462d440bd3514f3/examples/src/streaming/server.rs#L15
fn unwrap_io_error(status: &Status) -> Option<&std::io::Error> {
    let mut err: &(dyn std::error::Error + 'static) = status;

    loop {
        if let Some(e) = err.downcast_ref::<std::io::Error>() {
            return Some(e);
        }

        // https://github.com/hyperium/h2/pull/462
        if let Some(e) = err.downcast_ref::<h2::Error>().and_then(|e| e.get_io()) {
            return Some(e);
        }

        err = err.source()?;
    }
}
