//! Scripted client: logs in, walks in a circle, answers probes, then quits.

use clap::Parser;
use shared::{
    decode_frame, decode_payload, encode_frame, AccessDenied, ChatMessage, Kicked, LoginAccepted,
    LoginRequest, OnlineId, Opcode, Ping, PlayerSync, PlayerUpdate, Position, QueuePosition, Quit,
    Scoreboard, ScoreboardProbe, SpawnState, TransportProbe, SERVER_VERSION,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::interval;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,
    #[clap(short, long, default_value = "tester")]
    username: String,
    #[clap(long, default_value = "")]
    password: String,
    /// Seconds to stay logged in
    #[clap(short, long, default_value = "10")]
    duration: u64,
    /// Position updates per second
    #[clap(long, default_value = "10")]
    rate: u32,
}

// Get current timestamp in milliseconds
fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

struct Session {
    online_id: Option<OnlineId>,
    spawn: Position,
    updates_sent: u32,
    syncs_seen: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    let login = LoginRequest {
        slot: 0,
        username: args.username.clone(),
        password: args.password.clone(),
        client_version: SERVER_VERSION.to_string(),
        platform_id: None,
    };
    socket
        .send_to(&encode_frame(Opcode::Login, &login)?, args.server)
        .await?;
    println!("Sent login for {} to {}", args.username, args.server);

    let mut session = Session {
        online_id: None,
        spawn: Position::default(),
        updates_sent: 0,
        syncs_seen: 0,
    };
    let mut buf = [0u8; 2048];
    let mut updates = interval(Duration::from_secs_f64(1.0 / args.rate.max(1) as f64));
    let mut pings = interval(Duration::from_secs(1));
    let started = Instant::now();
    let deadline = Duration::from_secs(args.duration);

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, _) = received?;
                if !handle_frame(&socket, &args, &mut session, &buf[..len]).await? {
                    return Ok(());
                }
            }
            _ = updates.tick() => {
                let Some(online_id) = session.online_id else {
                    continue;
                };
                if started.elapsed() >= deadline {
                    break;
                }
                let angle = session.updates_sent as f32 * 0.1;
                let update = PlayerUpdate {
                    slot: 0,
                    position: Position::new(
                        session.spawn.x + angle.cos() * 5.0,
                        session.spawn.y + angle.sin() * 5.0,
                        0.0,
                    ),
                    direction: angle,
                    moving: true,
                };
                socket.send_to(&encode_frame(Opcode::PlayerUpdate, &update)?, args.server).await?;
                session.updates_sent += 1;
                if session.updates_sent % 50 == 0 {
                    let chat = ChatMessage {
                        online_id,
                        text: format!("{} updates sent", session.updates_sent),
                    };
                    socket.send_to(&encode_frame(Opcode::ChatMessage, &chat)?, args.server).await?;
                }
            }
            _ = pings.tick() => {
                let ping = Ping { timestamp: get_timestamp() };
                socket.send_to(&encode_frame(Opcode::Ping, &ping)?, args.server).await?;
            }
        }
    }

    socket.send_to(&encode_frame(Opcode::ScoreboardProbe, &ScoreboardProbe)?, args.server).await?;
    if let Ok(Ok((len, _))) =
        tokio::time::timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await
    {
        handle_frame(&socket, &args, &mut session, &buf[..len]).await?;
    }
    socket.send_to(&encode_frame(Opcode::Quit, &Quit)?, args.server).await?;
    println!(
        "Quit after {} updates ({} player syncs received)",
        session.updates_sent, session.syncs_seen
    );
    Ok(())
}

/// Returns `false` when the server ended the session.
async fn handle_frame(
    socket: &UdpSocket,
    args: &Args,
    session: &mut Session,
    frame: &[u8],
) -> Result<bool, Box<dyn std::error::Error>> {
    let (opcode, payload) = match decode_frame(frame) {
        Ok(decoded) => decoded,
        Err(e) => {
            println!("Undecodable frame: {}", e);
            return Ok(true);
        }
    };

    match opcode {
        Opcode::LoginAccepted => {
            let accepted: LoginAccepted = decode_payload(payload)?;
            println!(
                "Logged in as online id {} ({})",
                accepted.online_id, accepted.access_level
            );
            session.online_id = Some(accepted.online_id);
        }
        Opcode::SpawnState => {
            let spawn: SpawnState = decode_payload(payload)?;
            println!("Spawned at ({:.1}, {:.1})", spawn.position.x, spawn.position.y);
            session.spawn = spawn.position;
        }
        Opcode::AccessDenied => {
            let denied: AccessDenied = decode_payload(payload)?;
            println!("Access denied: {}", denied.reason);
            return Ok(false);
        }
        Opcode::Kicked => {
            let kicked: Kicked = decode_payload(payload)?;
            println!("Kicked: {}", kicked.reason);
            return Ok(false);
        }
        Opcode::QueuePosition => {
            let queue: QueuePosition = decode_payload(payload)?;
            println!("Waiting in queue at position {}", queue.position);
        }
        Opcode::TransportProbe => {
            let probe: TransportProbe = decode_payload(payload)?;
            socket
                .send_to(&encode_frame(Opcode::TransportProbeAck, &probe)?, args.server)
                .await?;
        }
        Opcode::Pong => {
            let pong: Ping = decode_payload(payload)?;
            println!("RTT: {} ms", get_timestamp().saturating_sub(pong.timestamp));
        }
        Opcode::Scoreboard => {
            let board: Scoreboard = decode_payload(payload)?;
            println!("Online: {}", board.players.join(", "));
        }
        Opcode::PlayerSync => {
            let _sync: PlayerSync = decode_payload(payload)?;
            session.syncs_seen += 1;
        }
        other => println!("Received {}", other.name()),
    }
    Ok(true)
}
