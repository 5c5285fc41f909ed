use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use peer_link::messaging::{DeliveryPolicy, Inbound, MessageTunnel, TunnelOptions};
use peer_link::model::{
    ClientSource, ConnectionPassword, ConnectionSecrets, DataChannelId, NegotiationRole,
};
use peer_link::signaling::{connect_relay, RelayTunnel, SignalingChannel};
use peer_link::telemetry::{self, LogConfig, LogLevel};
use peer_link::{LinkConfig, RtcClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use url::Url;

const RELAY_DIAL_ATTEMPTS: u32 = 5;
const RELAY_DIAL_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "peer-link", about = "Open a data link to a peer through a signaling relay")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, env = "PEER_LINK_LOG_LEVEL")]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr", env = "PEER_LINK_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh connection password.
    Generate,
    /// Print the connection id a password maps to.
    Password {
        #[arg(long)]
        password: ConnectionPassword,
    },
    /// Connect to the peer and bridge stdin lines to the data channel.
    Connect {
        #[arg(long, env = "PEER_LINK_PASSWORD")]
        password: ConnectionPassword,
        #[arg(long, default_value = "extension")]
        source: ClientSource,
        #[arg(long, default_value = "initiator")]
        role: NegotiationRole,
        #[arg(long, default_value_t = 0)]
        channel: u16,
        #[arg(long)]
        signaling_url: Option<String>,
        #[arg(long, help = "Wait for the peer to confirm each line")]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file,
    })
    .context("failed to initialise logging")?;

    match cli.command {
        Command::Generate => {
            println!("{}", ConnectionPassword::random().to_hex());
            Ok(())
        }
        Command::Password { password } => {
            let secrets = ConnectionSecrets::from_password(password);
            println!("{}", secrets.connection_id());
            Ok(())
        }
        Command::Connect {
            password,
            source,
            role,
            channel,
            signaling_url,
            confirm,
        } => {
            let mut config = LinkConfig::new(ConnectionSecrets::from_password(password), role, source);
            if let Some(url) = signaling_url {
                config.signaling_server = config
                    .signaling_server
                    .with_base_url(&url)
                    .context("invalid --signaling-url")?;
            }
            let mut options = TunnelOptions {
                channel: config.data_channel,
                ..TunnelOptions::default()
            };
            if confirm {
                options.delivery = DeliveryPolicy::AwaitConfirmation {
                    timeout: config.signaling_channel.confirmation_timeout,
                };
            }
            run_link(config, DataChannelId(channel), options).await
        }
    }
}

async fn run_link(config: LinkConfig, channel: DataChannelId, options: TunnelOptions) -> Result<()> {
    let peer = config.secrets.connection_id();
    let url = config
        .signaling_server
        .server_url(&peer, config.source)
        .context("failed to build relay url")?;
    let relay = dial_relay(url, config.signaling_server.ping_interval).await?;
    let signaling = SignalingChannel::new(
        relay,
        &config.secrets,
        config.source,
        config.signaling_channel,
    );

    let client = RtcClient::with_webrtc(config.webrtc).context("failed to set up webrtc")?;
    let mut reconnections = client.reconnections();
    client
        .new_connection(peer, config.role, signaling)
        .await
        .context("failed to register peer connection")?;
    let mut tunnel: MessageTunnel<String> = client
        .new_tunnel(&peer, channel, options.clone())
        .await
        .context("failed to open data channel")?;
    let mut inbound = tunnel.incoming();
    let mut attached = true;
    info!(target = "peer_link::cli", %peer, %channel, "waiting for peer");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match tunnel.send_message(line).await {
                    Ok(message_id) => info!(target = "peer_link::cli", %message_id, "sent"),
                    Err(err) => warn!(target = "peer_link::cli", error = %err, "send failed"),
                }
            }
            item = inbound.recv(), if attached => match item {
                Some(Ok(Inbound::Message { message, .. })) => println!("{message}"),
                Some(Ok(Inbound::AssemblyFailed { message_id, error })) => {
                    warn!(target = "peer_link::cli", %message_id, %error, "dropped corrupt message");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => warn!(target = "peer_link::cli", error = %err, "undecodable frame"),
                // Closed; a reconnect brings a new channel.
                None => attached = false,
            },
            id = reconnections.recv() => {
                if id != Some(peer) {
                    continue;
                }
                tunnel = client
                    .tunnel(&peer, channel, &options)
                    .await
                    .context("failed to reattach data channel")?;
                inbound = tunnel.incoming();
                attached = true;
                info!(target = "peer_link::cli", %peer, "peer connection rebuilt");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect_all().await;
    Ok(())
}

async fn dial_relay(url: Url, ping_interval: Option<Duration>) -> Result<RelayTunnel> {
    let mut attempt = 1;
    loop {
        let err = match connect_relay(url.clone(), ping_interval).await {
            Ok(relay) => return Ok(relay),
            Err(err) => err,
        };
        let Some(delay) = dial_backoff(attempt) else {
            warn!(target = "peer_link::cli", attempt, error = %err, "relay dial failed; giving up");
            bail!("could not reach relay at {url} after {RELAY_DIAL_ATTEMPTS} attempts");
        };
        warn!(
            target = "peer_link::cli",
            attempt,
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "relay dial failed"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Delay before the attempt following `attempt`, or `None` once attempts run out.
fn dial_backoff(attempt: u32) -> Option<Duration> {
    (attempt < RELAY_DIAL_ATTEMPTS).then(|| RELAY_DIAL_BACKOFF.saturating_mul(1 << (attempt - 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_between_attempts() {
        assert_eq!(dial_backoff(1), Some(Duration::from_millis(500)));
        assert_eq!(dial_backoff(2), Some(Duration::from_millis(1000)));
        assert_eq!(dial_backoff(4), Some(Duration::from_millis(4000)));
    }

    #[test]
    fn no_wait_after_the_last_attempt() {
        assert_eq!(dial_backoff(RELAY_DIAL_ATTEMPTS), None);
    }

    #[test]
    fn connect_defaults_parse() {
        let cli = Cli::try_parse_from(["peer-link", "connect", "--password", &"ab".repeat(32)])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Command::Connect {
                role: NegotiationRole::Initiator,
                source: ClientSource::Extension,
                channel: 0,
                confirm: false,
                ..
            }
        ));
    }
}
