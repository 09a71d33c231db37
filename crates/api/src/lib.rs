//! HTTP control surface.
//!
//! A thin layer over the mesh and allocator handles: parse the
//! request, call the handle, map the error to a status code. Bound to
//! loopback by the daemon.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::http::StatusCode;
use warp::Filter;

use weave_ipam::{Error as IpamError, IpamHandle};
use weave_mesh::client::handle::Handle as MeshHandle;
use weave_types::{PeerName, DEFAULT_PORT};

/// Server configuration.
pub struct ApiConfig {
    /// Address to serve on; loopback unless the operator insists.
    pub listen: SocketAddr,
}

/// Parse a `host[:port]` peer specification.
fn parse_peer(spec: &str) -> Option<SocketAddr> {
    let candidate = if spec.contains(':') {
        spec.to_owned()
    } else {
        format!("{spec}:{DEFAULT_PORT}")
    };
    candidate.to_socket_addrs().ok()?.next()
}

fn ipam_error_status(err: &IpamError) -> StatusCode {
    match err {
        IpamError::NoQuorum(_) | IpamError::RangeExhausted => StatusCode::SERVICE_UNAVAILABLE,
        IpamError::NotOurs(_) | IpamError::AddressInUse(_) => StatusCode::BAD_REQUEST,
        IpamError::UnknownPeer(_) => StatusCode::NOT_FOUND,
        IpamError::PeerStillLive(_) => StatusCode::CONFLICT,
        IpamError::Shutdown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn text(status: StatusCode, body: impl Into<String>) -> impl warp::Reply {
    warp::reply::with_status(body.into(), status)
}

/// Build the filter tree over the two handles.
pub fn routes<H>(
    mesh: H,
    ipam: IpamHandle,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone
where
    H: MeshHandle + 'static,
{
    let mesh_filter = warp::any().map(move || mesh.clone());
    let ipam_filter = warp::any().map(move || ipam.clone());

    let status = warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(mesh_filter.clone())
        .and(ipam_filter.clone())
        .and_then(status_text);

    let status_json = warp::path("status-json")
        .and(warp::path::end())
        .and(warp::get())
        .and(mesh_filter.clone())
        .and(ipam_filter.clone())
        .and_then(status_json);

    let connect = warp::path("connect")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(mesh_filter.clone())
        .and_then(connect);

    let forget = warp::path("forget")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(mesh_filter)
        .and_then(forget);

    let ip_claim = warp::path("ip")
        .and(warp::path::param::<String>())
        .and(warp::path::param::<Ipv4Addr>())
        .and(warp::path::end())
        .and(warp::put())
        .and(ipam_filter.clone())
        .and_then(ip_claim);

    let ip_allocate = warp::path("ip")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::post())
        .and(ipam_filter.clone())
        .and_then(ip_allocate);

    let ip_release = warp::path("ip")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(ipam_filter.clone())
        .and_then(ip_release);

    let peer_remove = warp::path("peer")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(ipam_filter)
        .and_then(peer_remove);

    status
        .or(status_json)
        .or(connect)
        .or(forget)
        .or(ip_claim)
        .or(ip_allocate)
        .or(ip_release)
        .or(peer_remove)
}

async fn status_text<H: MeshHandle>(
    mesh: H,
    ipam: IpamHandle,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    let Ok(report) = mesh.status().await else {
        return Ok(Box::new(text(
            StatusCode::INTERNAL_SERVER_ERROR,
            "router unavailable",
        )));
    };

    let mut body = report.to_string();
    if let Ok(status) = ipam.status().await {
        body.push_str(&format!(
            "\nipam range {} (quorum {}, {})\n",
            status.range,
            status.quorum,
            if status.seeded { "seeded" } else { "awaiting quorum" },
        ));
        for token in &status.ring {
            body.push_str(&format!(
                "  {} -> {} (v{})\n",
                token.token, token.owner, token.version
            ));
        }
        for (container, addrs) in &status.claims {
            let addrs: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
            body.push_str(&format!("  {}: {}\n", container, addrs.join(", ")));
        }
    }

    Ok(Box::new(text(StatusCode::OK, body)))
}

async fn status_json<H: MeshHandle>(
    mesh: H,
    ipam: IpamHandle,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    let Ok(report) = mesh.status().await else {
        return Ok(Box::new(StatusCode::INTERNAL_SERVER_ERROR));
    };
    let ipam_status = ipam.status().await.ok();

    let body = serde_json::json!({
        "router": report,
        "ipam": ipam_status,
    });
    Ok(Box::new(warp::reply::json(&body)))
}

async fn connect<H: MeshHandle>(
    form: HashMap<String, String>,
    mesh: H,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    let Some(addr) = form.get("peer").and_then(|spec| parse_peer(spec)) else {
        return Ok(Box::new(text(
            StatusCode::BAD_REQUEST,
            "unparseable peer address",
        )));
    };

    match mesh.connect(addr).await {
        Ok(()) => Ok(Box::new(text(StatusCode::OK, format!("connecting to {addr}\n")))),
        Err(_) => Ok(Box::new(StatusCode::INTERNAL_SERVER_ERROR)),
    }
}

async fn forget<H: MeshHandle>(
    form: HashMap<String, String>,
    mesh: H,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    // Forgetting never fails: an unknown or unparseable target is
    // already as forgotten as it gets.
    if let Some(addr) = form.get("peer").and_then(|spec| parse_peer(spec)) {
        mesh.forget(addr).await.ok();
    }
    Ok(Box::new(StatusCode::OK))
}

async fn ip_claim(
    container: String,
    addr: Ipv4Addr,
    ipam: IpamHandle,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    match ipam.claim(&container, addr).await {
        Ok(()) => Ok(Box::new(StatusCode::OK)),
        Err(err) => Ok(Box::new(text(ipam_error_status(&err), err.to_string()))),
    }
}

async fn ip_allocate(
    container: String,
    ipam: IpamHandle,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    match ipam.allocate(&container).await {
        Ok(net) => Ok(Box::new(text(StatusCode::OK, format!("{net}\n")))),
        Err(err) => Ok(Box::new(text(ipam_error_status(&err), err.to_string()))),
    }
}

async fn ip_release(
    container: String,
    ipam: IpamHandle,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    match ipam.free(&container).await {
        Ok(freed) => {
            let freed: Vec<String> = freed.iter().map(|a| a.to_string()).collect();
            Ok(Box::new(text(StatusCode::OK, freed.join("\n"))))
        }
        Err(err) => Ok(Box::new(text(ipam_error_status(&err), err.to_string()))),
    }
}

async fn peer_remove(
    name: String,
    ipam: IpamHandle,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    let Ok(name) = name.parse::<PeerName>() else {
        return Ok(Box::new(text(
            StatusCode::BAD_REQUEST,
            "unparseable peer name",
        )));
    };

    match ipam.remove_peer(name).await {
        Ok(()) => Ok(Box::new(StatusCode::OK)),
        Err(err) => Ok(Box::new(text(ipam_error_status(&err), err.to_string()))),
    }
}

/// Serve the control API until cancelled.
pub async fn run_server<H>(
    config: ApiConfig,
    mesh: H,
    ipam: IpamHandle,
    cancellation: CancellationToken,
) -> eyre::Result<()>
where
    H: MeshHandle + 'static,
{
    let routes = routes(mesh, ipam);

    let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(config.listen, async move {
        cancellation.cancelled().await;
    });
    info!(target: "api", "Control API listening on {}", addr);

    server.await;
    Ok(())
}
