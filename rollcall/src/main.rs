use std::error::Error;
use std::future::{self, Future};

use chrono::Utc;
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;

use rollcall_api as api;
use rollcall_attendance as attendance;
use rollcall_remote as remote;
use rollcall_util as util;

use crate::api::{ApiState, Listener, LocalAddress};
use crate::attendance::{
    AttendanceClient, PersistedState, Pipeline, PipelineHandle, StateStore, SubmissionConfig,
    start_session_store, start_submit,
};
use crate::cli::Cli;
use crate::remote::{
    Backlog, ConnectivityManager, DeviceIdentity, HeartbeatRecord, LinkConfig, LinkStatus,
    PollRequest, RemoteConfig, TcpCheck, start_heartbeat, start_link, start_poll,
};
use crate::util::dirs::state_dir;
use crate::util::store::StoreError;
use crate::util::types::DeviceId;

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("debug,hyper=error,hyper_util=error,reqwest=info")
            }),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    initialize_tracing();

    let cli = cli::parse();

    let store = if cli.no_persistence {
        warn!("persistence disabled, state will be lost on restart");
        StateStore::memory()
    } else {
        let dir = cli.data_dir.clone().unwrap_or_else(state_dir);
        debug!("using data directory {}", dir.display());
        StateStore::disk(dir)
    };

    let remote_config = cli.remote_config();
    let identity = load_identity(&cli, &store).await?;
    let identity = if cli.register {
        maybe_register(remote_config.as_ref(), identity, &store).await
    } else {
        identity
    };

    // Any events found here were left behind by a previous run
    let state = store.load(Utc::now()).await?;

    start_agent(
        identity,
        store,
        state,
        remote_config,
        cli.link_config(),
        cli.submission_config(),
        cli.local_api_address.clone(),
    )
    .await
}

#[instrument(name = "rollcall", skip_all, err)]
async fn start_agent(
    identity: DeviceIdentity,
    store: StateStore,
    state: PersistedState,
    remote_config: Option<RemoteConfig>,
    link_config: LinkConfig,
    submission_config: SubmissionConfig,
    local_address: Option<LocalAddress>,
) -> Result<(), Box<dyn Error>> {
    trace!(
        identity = ?identity,
        remote = ?remote_config,
        link = ?link_config,
        submission = ?submission_config,
        "using config:"
    );

    // Set-up channels shared by the agent components. The stored session
    // is used until the first poll, unless it is already stale.
    if let Some(session) = &state.session {
        debug!(session = ?session.session_id, fetched_at = %session.fetched_at, "found stored session");
    }
    let (session_tx, session_rx) = watch::channel(state.session);
    let (backlog_tx, backlog_rx) = watch::channel(Backlog::default());
    let (heartbeat_tx, heartbeat_rx) = watch::channel(HeartbeatRecord::default());
    let (poll_request_tx, poll_request_rx) = watch::channel(PollRequest);

    // Without a server the link is never brought up
    let (_unmanaged_link_tx, unmanaged_link_rx) = watch::channel(LinkStatus::default());
    let link_manager = remote_config.as_ref().map(|config| {
        let check = TcpCheck::new(&config.api_endpoint, config.request.timeout);
        ConnectivityManager::new(check, &link_config)
    });
    let link_rx = link_manager
        .as_ref()
        .map(|manager| manager.subscribe())
        .unwrap_or(unmanaged_link_rx);

    let submitter = match &remote_config {
        Some(config) => Some(AttendanceClient::new(config, &identity)?),
        None => None,
    };
    let session_store = store.clone();
    let pipeline = Pipeline::new(
        &submission_config,
        store,
        submitter,
        state.events,
        session_rx.clone(),
        backlog_tx,
    );
    let (pipeline_handle, pipeline_rx) = PipelineHandle::channel(32);

    // Setup local API server
    let listener = if let Some(local_address) = &local_address {
        let listener = match local_address {
            LocalAddress::Tcp(socket_addr) => Listener::Tcp(TcpListener::bind(socket_addr).await?),
            LocalAddress::Unix(path) => Listener::Unix(UnixListener::bind(path)?),
        };
        debug!("bound to local address {local_address}");
        Some(listener)
    } else {
        None
    };

    if remote_config.is_none() {
        warn!("running in unmanaged mode, attendance is stored but not submitted");
    }

    // Start main loop, the agent only stops on a shutdown signal
    tokio::select! {
        // Start local API server
        _ = maybe_start(listener, |listener| {
            api::start(
                listener,
                ApiState {
                    identity: identity.clone(),
                    session_check_interval: submission_config.session_check_interval,
                    link_rx: link_rx.clone(),
                    session_rx: session_rx.clone(),
                    heartbeat_rx,
                    backlog_rx: backlog_rx.clone(),
                    poll_tx: poll_request_tx,
                    pipeline: pipeline_handle,
                },
            )
        }) => Ok(()),

        // Start link supervision
        _ = maybe_start(link_manager, start_link) => Ok(()),

        // Start heartbeats
        _ = maybe_start(remote_config.as_ref(), |config| {
            start_heartbeat(
                config,
                &identity,
                link_rx.clone(),
                backlog_rx.clone(),
                heartbeat_tx,
            )
        }) => Ok(()),

        // Start session polling
        _ = maybe_start(remote_config.as_ref(), |config| {
            start_poll(
                config,
                &identity,
                link_rx.clone(),
                poll_request_rx,
                session_tx,
            )
        }) => Ok(()),

        // Keep the latest session for the next boot
        _ = maybe_start(remote_config.as_ref(), |_| {
            start_session_store(session_store, session_rx.clone())
        }) => Ok(()),

        // Start attendance submission
        _ = start_submit(pipeline, link_rx.clone(), pipeline_rx) => Ok(()),

        _ = shutdown_signal() => {
            // in-flight requests are dropped with their tasks
            info!("shutting down");
            Ok(())
        }
    }
}

/// Given an optional value `pred`, invoke closure `f` if it is `Some(P)`
/// and return the result, otherwise return a pending future in its place.
///
/// This is useful to reduce boilerplate in our main loop `select!`.
async fn maybe_start<P, F, Fut, T>(pred: Option<P>, f: F) -> T
where
    Fut: Future<Output = T>,
    F: FnOnce(P) -> Fut,
{
    match pred {
        Some(p) => f(p).await,
        None => future::pending().await,
    }
}

/// Resolve when the process is asked to stop
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {e}");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[derive(Debug, Error)]
enum IdentityError {
    #[error("failed to read/write device identity: {0}")]
    Store(#[from] StoreError),

    #[error("a location is required to set up a new device")]
    MissingLocation,
}

/// Resolve the device identity
///
/// The identity is created once, from the CLI arguments, and stored before
/// anything else happens. From then on the stored identity is used and any
/// different values on the CLI are ignored.
async fn load_identity(cli: &Cli, store: &StateStore) -> Result<DeviceIdentity, IdentityError> {
    if let Some(identity) = store.load_identity().await? {
        if cli
            .device_id
            .as_ref()
            .is_some_and(|id| *id != *identity.device_id)
        {
            warn!("ignoring --device-id argument that is different to the stored identity");
        }
        if cli
            .display_name
            .as_ref()
            .is_some_and(|name| *name != identity.display_name)
        {
            warn!("ignoring --display-name argument that is different to the stored identity");
        }
        if cli
            .location
            .as_ref()
            .is_some_and(|location| *location != identity.location)
        {
            warn!("ignoring --location argument that is different to the stored identity");
        }

        return Ok(identity);
    }

    let location = cli.location.clone().ok_or(IdentityError::MissingLocation)?;

    // Generate a device id if none provided
    let device_id = cli
        .device_id
        .clone()
        .map(DeviceId::from)
        .unwrap_or_default();
    let display_name = cli
        .display_name
        .clone()
        .unwrap_or_else(|| device_id.to_string());

    let identity = DeviceIdentity {
        device_id,
        display_name,
        location,
        registered: false,
    };
    store.save_identity(&identity).await?;
    info!(device_id = %identity.device_id, location = %identity.location, "new device identity stored");

    Ok(identity)
}

/// Register with the server unless that already happened on an earlier
/// boot. Registration failures are not fatal, the agent works without it.
async fn maybe_register(
    config: Option<&RemoteConfig>,
    identity: DeviceIdentity,
    store: &StateStore,
) -> DeviceIdentity {
    let Some(config) = config else {
        return identity;
    };
    if identity.registered {
        debug!("device already registered");
        return identity;
    }

    match remote::register(config, &identity).await {
        Ok(()) => {
            let identity = DeviceIdentity {
                registered: true,
                ..identity
            };
            if let Err(e) = store.save_identity(&identity).await {
                warn!("failed to store registration: {e}");
            }
            identity
        }
        Err(e) => {
            warn!("device registration failed: {e}");
            identity
        }
    }
}
