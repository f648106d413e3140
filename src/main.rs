//! Entry point for `tun-tcpip`.
//!
//! Opens a TUN device and serves two small services from the user-space
//! stack: a fixed HTTP page over TCP and a UDP echo.  `main.rs` owns only
//! process setup (logging, signal handling, argument parsing); the stack
//! itself runs on a dedicated thread because it is single-threaded by
//! construction.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use tun_tcpip::config::{DeviceConfig, DeviceMode, StackConfig};
use tun_tcpip::connection::ReadOutcome;
use tun_tcpip::device::TunDevice;
use tun_tcpip::event_loop::StopHandle;
use tun_tcpip::packet::{IPV4_HEADER_LEN, TCP_HEADER_LEN};
use tun_tcpip::socket::{Protocol, SocketEvent, SocketId};
use tun_tcpip::socket_manager::SocketManager;
use tun_tcpip::stack::Stack;

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: 13\r\n\
Connection: close\r\n\
\r\n\
Hello, World!";

/// Largest request head buffered before the connection is dropped.
const MAX_REQUEST: usize = 8 * 1024;

/// User-space TCP/IP stack over a TUN device.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve an HTTP hello page and a UDP echo on the device.
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Interface name to create or attach to.
    #[arg(short, long, default_value = "tun0")]
    device: String,

    #[arg(long, value_enum, default_value_t = DeviceMode::Tun)]
    mode: DeviceMode,

    /// Address the stack answers on (configure the peer side with `ip addr`).
    #[arg(short, long, default_value = "10.0.0.2")]
    addr: Ipv4Addr,

    #[arg(long, default_value_t = 8080)]
    http_port: u16,

    #[arg(long, default_value_t = 9090)]
    udp_port: u16,

    #[arg(long, default_value_t = 1500)]
    mtu: usize,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();
    log::info!("Starting stack on {} as {}", args.device, args.addr);

    let (handle_tx, handle_rx) = tokio::sync::oneshot::channel();
    let mut worker = tokio::task::spawn_blocking(move || run_stack(args, handle_tx));

    // The worker only drops the sender without sending if setup failed.
    let Ok(stop) = handle_rx.await else {
        return worker.await.context("stack thread panicked")?;
    };

    tokio::select! {
        res = &mut worker => return res.context("stack thread panicked")?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted; stopping");
            stop.stop().context("signalling the event loop")?;
        }
    }
    worker.await.context("stack thread panicked")?
}

fn run_stack(args: ServeArgs, handle_tx: tokio::sync::oneshot::Sender<StopHandle>) -> Result<()> {
    let device = TunDevice::open(&DeviceConfig {
        name: args.device.clone(),
        mode: args.mode,
        mtu: args.mtu,
    })
    .with_context(|| format!("opening device {}", args.device))?;

    let config = StackConfig {
        local_addr: args.addr,
        mss: u16::try_from(args.mtu.saturating_sub(IPV4_HEADER_LEN + TCP_HEADER_LEN))
            .unwrap_or(u16::MAX),
        mtu: args.mtu,
        ..StackConfig::default()
    };
    let mut stack = Stack::new(device, config).context("starting the stack")?;

    let mut services = {
        let mut sockets = stack.sockets();
        let http = sockets.create(Protocol::Tcp);
        sockets.bind(http, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, args.http_port))?;
        sockets.listen(http, 0)?;
        let echo = sockets.create(Protocol::Udp);
        sockets.bind(echo, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, args.udp_port))?;
        log::info!(
            "HTTP on {}:{}, UDP echo on {}:{}",
            args.addr,
            args.http_port,
            args.addr,
            args.udp_port
        );
        Services::new(http, echo)
    };
    stack.set_app(move |sockets, event| services.on_event(sockets, event));

    // The receiver is gone only if the runtime is shutting down already.
    let _ = handle_tx.send(stack.stop_handle());
    stack.run()?;
    log::info!("Stack stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

struct Services {
    http: SocketId,
    echo: SocketId,
    /// Partial request heads, per accepted connection.
    requests: HashMap<SocketId, Vec<u8>>,
}

impl Services {
    fn new(http: SocketId, echo: SocketId) -> Self {
        Self {
            http,
            echo,
            requests: HashMap::new(),
        }
    }

    fn on_event(&mut self, sockets: &mut SocketManager, event: SocketEvent) {
        match event {
            SocketEvent::Acceptable(id) if id == self.http => self.accept_all(sockets),
            SocketEvent::Readable(id) | SocketEvent::PeerClosed(id) => self.serve_http(sockets, id),
            SocketEvent::Datagram(id) if id == self.echo => self.echo_all(sockets),
            SocketEvent::Closed(id) => {
                self.requests.remove(&id);
            }
            _ => {}
        }
    }

    fn accept_all(&mut self, sockets: &mut SocketManager) {
        while let Ok(Some((child, peer))) = sockets.try_accept(self.http) {
            log::info!("HTTP connection {child} from {peer}");
            self.requests.insert(child, Vec::new());
        }
    }

    fn serve_http(&mut self, sockets: &mut SocketManager, id: SocketId) {
        let Some(buf) = self.requests.get_mut(&id) else {
            return;
        };
        loop {
            match sockets.read(id, 4096) {
                Ok(ReadOutcome::Data(bytes)) => buf.extend_from_slice(&bytes),
                Ok(ReadOutcome::WouldBlock) => break,
                Ok(ReadOutcome::Eof) | Err(_) => {
                    self.requests.remove(&id);
                    sockets.close(id);
                    return;
                }
            }
        }

        let complete = buf.windows(4).any(|w| w == b"\r\n\r\n");
        if !complete && buf.len() < MAX_REQUEST {
            return;
        }
        if complete {
            if let Err(e) = sockets.send(id, RESPONSE) {
                log::warn!("HTTP {id}: {e}");
            }
        } else {
            log::warn!("HTTP {id}: request head too large; dropping");
        }
        self.requests.remove(&id);
        sockets.close(id);
    }

    fn echo_all(&mut self, sockets: &mut SocketManager) {
        while let Ok(Some((data, from))) = sockets.try_recvfrom(self.echo) {
            if let Err(e) = sockets.sendto(self.echo, &data, from) {
                log::warn!("UDP echo to {from}: {e}");
            }
        }
    }
}
