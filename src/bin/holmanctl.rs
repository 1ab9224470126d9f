//! Command line tool for Holman tap timers.
//!
//! Run with: holmanctl --discover
//!
//! Set `RUST_LOG` to change what gets logged, or pass `--verbose`.

use btleplug::api::BDAddr;
use clap::{ArgGroup, Parser};
use holman_ble::{
    parse_address, Error, ManagerConfig, Result, TapTimer, TapTimerListener, TapTimerManager,
    TapTimerManagerListener, DEFAULT_RUNTIME_MINUTES,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "holmanctl")]
#[command(about = "Control Holman Bluetooth tap timers")]
#[command(group(
    ArgGroup::new("command")
        .required(true)
        .args(["discover", "known", "connect", "auto", "disconnect", "start", "stop", "status"])
))]
struct Cli {
    /// Name of Bluetooth adapter
    #[arg(long, default_value = "hci0")]
    adapter: String,

    /// List all nearby tap timers
    #[arg(long)]
    discover: bool,

    /// List all tap timers known to the adapter
    #[arg(long)]
    known: bool,

    /// Connect to the tap timer with the given MAC address
    #[arg(long, value_name = "ADDRESS", value_parser = parse_address)]
    connect: Option<BDAddr>,

    /// Connect and automatically reconnect to the tap timer with the given MAC address
    #[arg(long, value_name = "ADDRESS", value_parser = parse_address)]
    auto: Option<BDAddr>,

    /// Disconnect the tap timer with the given MAC address
    #[arg(long, value_name = "ADDRESS", value_parser = parse_address)]
    disconnect: Option<BDAddr>,

    /// Turn on the tap of the tap timer with the given MAC address
    #[arg(long, value_name = "ADDRESS", value_parser = parse_address)]
    start: Option<BDAddr>,

    /// Turn off the tap of the tap timer with the given MAC address
    #[arg(long, value_name = "ADDRESS", value_parser = parse_address)]
    stop: Option<BDAddr>,

    /// Print whether the tap of the tap timer with the given MAC address is on
    #[arg(long, value_name = "ADDRESS", value_parser = parse_address)]
    status: Option<BDAddr>,

    /// Watering time in minutes for --start (at most 255)
    #[arg(long, default_value_t = DEFAULT_RUNTIME_MINUTES, requires = "start")]
    minutes: u32,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Discover,
    Known,
    Connect { address: BDAddr, auto: bool },
    Disconnect(BDAddr),
    Start { address: BDAddr, minutes: u32 },
    Stop(BDAddr),
    Status(BDAddr),
}

impl Cli {
    fn action(&self) -> Action {
        if self.discover {
            Action::Discover
        } else if self.known {
            Action::Known
        } else if let Some(address) = self.connect {
            Action::Connect {
                address,
                auto: false,
            }
        } else if let Some(address) = self.auto {
            Action::Connect {
                address,
                auto: true,
            }
        } else if let Some(address) = self.disconnect {
            Action::Disconnect(address)
        } else if let Some(address) = self.start {
            Action::Start {
                address,
                minutes: self.minutes,
            }
        } else if let Some(address) = self.stop {
            Action::Stop(address)
        } else if let Some(address) = self.status {
            Action::Status(address)
        } else {
            // The required argument group guarantees one of the above.
            Action::Discover
        }
    }
}

/// Events that end a connect session.
#[derive(Debug)]
enum SessionEvent {
    ConnectFailed,
    Disconnected,
}

/// Prints every tap timer event.
struct PrintListener {
    events: mpsc::UnboundedSender<SessionEvent>,
    auto_reconnect: bool,
}

impl PrintListener {
    fn print(tap_timer: &TapTimer, message: &str) {
        println!("Holman tap timer {} {}", tap_timer.mac_address(), message);
    }
}

impl TapTimerListener for PrintListener {
    fn started_connecting(&self, tap_timer: &TapTimer) {
        Self::print(tap_timer, "connecting...");
    }

    fn connect_succeeded(&self, tap_timer: &TapTimer) {
        Self::print(tap_timer, "connected");
    }

    fn connect_failed(&self, tap_timer: &TapTimer, error: &Error) {
        Self::print(tap_timer, &format!("connect failed: {}", error));
        let _ = self.events.send(SessionEvent::ConnectFailed);
    }

    fn started_disconnecting(&self, tap_timer: &TapTimer) {
        Self::print(tap_timer, "disconnecting...");
    }

    fn disconnect_succeeded(&self, tap_timer: &TapTimer) {
        Self::print(tap_timer, "disconnected");
        if self.auto_reconnect && tap_timer.is_auto_reconnect() {
            println!("Disconnected, reconnecting...");
        }
        let _ = self.events.send(SessionEvent::Disconnected);
    }
}

struct DiscoveryPrinter;

impl TapTimerManagerListener for DiscoveryPrinter {
    fn tap_timer_discovered(&self, tap_timer: &Arc<TapTimer>) {
        println!("Discovered Holman tap timer {}", tap_timer.mac_address());
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,holman_ble=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,holman_ble=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = ManagerConfig::default().adapter_name(cli.adapter.as_str());
    let manager = Arc::new(TapTimerManager::new(config).await?);

    match cli.action() {
        Action::Discover => discover(&manager).await,
        Action::Known => known(&manager).await,
        Action::Connect { address, auto } => connect(&manager, address, auto).await,
        Action::Disconnect(address) => disconnect(&manager, address).await,
        Action::Start { address, minutes } => {
            control(&manager, address, |t| async move { t.start(minutes).await }).await
        }
        Action::Stop(address) => {
            control(&manager, address, |t| async move { t.stop().await }).await
        }
        Action::Status(address) => control(&manager, address, |_| async { Ok(()) }).await,
    }
}

async fn discover(manager: &TapTimerManager) -> Result<()> {
    manager.set_listener(Arc::new(DiscoveryPrinter));
    manager.start_discovery().await?;

    println!("Terminate with Ctrl+C");
    let _ = tokio::signal::ctrl_c().await;

    manager.shutdown().await
}

async fn known(manager: &TapTimerManager) -> Result<()> {
    for tap_timer in manager.tap_timers().await? {
        let alias = tap_timer.alias().await.ok().flatten().unwrap_or_default();
        println!("[{}] {}", tap_timer.mac_address(), alias);
    }
    Ok(())
}

async fn connect(manager: &Arc<TapTimerManager>, address: BDAddr, auto: bool) -> Result<()> {
    let tap_timer = manager.tap_timer(address).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    tap_timer.set_auto_reconnect(auto);
    tap_timer.set_listener(Arc::new(PrintListener {
        events: tx,
        auto_reconnect: auto,
    }));

    let event_loop = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    // Failures reach the listener, which ends the session below.
    let _ = tap_timer.connect().await;

    println!("Terminate with Ctrl+C");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(SessionEvent::ConnectFailed) | None => break,
                Some(SessionEvent::Disconnected) if !auto => break,
                Some(SessionEvent::Disconnected) => {}
            },
        }
    }

    manager.shutdown().await?;
    let _ = event_loop.await;

    Ok(())
}

async fn disconnect(manager: &TapTimerManager, address: BDAddr) -> Result<()> {
    let tap_timer = manager.tap_timer(address).await?;

    let (tx, _rx) = mpsc::unbounded_channel();
    tap_timer.set_listener(Arc::new(PrintListener {
        events: tx,
        auto_reconnect: false,
    }));

    tap_timer.disconnect().await
}

/// Connect, run `action`, print the tap state and disconnect.
async fn control<F, Fut>(manager: &TapTimerManager, address: BDAddr, action: F) -> Result<()>
where
    F: FnOnce(Arc<TapTimer>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let tap_timer = manager.tap_timer(address).await?;

    let (tx, _rx) = mpsc::unbounded_channel();
    tap_timer.set_listener(Arc::new(PrintListener {
        events: tx,
        auto_reconnect: false,
    }));

    tap_timer.connect().await?;

    let result = action(tap_timer.clone()).await;
    if result.is_ok() {
        println!(
            "Holman tap timer {} is {}",
            tap_timer.mac_address(),
            tap_timer.state()
        );
    }

    command_outcome(result, tap_timer.disconnect().await)
}

/// The command's own result wins; a failed disconnect afterwards is only logged.
fn command_outcome(command: Result<()>, disconnect: Result<()>) -> Result<()> {
    if let Err(e) = disconnect {
        warn!("Failed to disconnect after the command: {}", e);
    }
    command
}
