use std::net::Ipv4Addr;
use clap::Parser;
use clap_derive::Parser;
use rustgroups::config::GroupsConfig;
use rustgroups::groups::group_events::GroupEvent;
use rustgroups::groups::group_member::join_group;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, Level};

/// joins a group and sends every line read from stdin as a message
#[derive(Parser)]
struct Args {
    group: String,

    #[clap(long, default_value = "239.255.42.99")]
    multicast_addr: Ipv4Addr,

    #[clap(long, default_value_t = 9876)]
    port: u16,

    #[clap(long, default_value_t = 1024)]
    chunk_size: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = GroupsConfig::new(args.multicast_addr, args.port);
    config.max_chunk_size = args.chunk_size;

    let member = join_group(config, &args.group).await?;
    info!("joined group {} as {}", args.group, member.id());

    member.add_listener(|msg| println!("> {}", String::from_utf8_lossy(msg)))?;
    let mut events = member.subscribe_events();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim() == "/members" => {
                        for m in member.members().await {
                            println!("  {} ({})", m.id, m.status);
                        }
                    }
                    Some(line) if line.trim() == "/time" => {
                        let now = member.net_time().now();
                        println!("  local {} / net {}", now.local_millis, now.net_millis);
                    }
                    Some(line) => {
                        if let Err(e) = member.send(line.as_bytes()).await {
                            error!("{}", e);
                        }
                    }
                    None => break,
                }
            }
            evt = events.recv() => {
                match evt {
                    Ok(GroupEvent::MemberJoined(id)) => println!("* {} joined", id),
                    Ok(GroupEvent::MemberLeft(id)) => println!("* {} left", id),
                    Ok(GroupEvent::MemberEvicted(id)) => println!("* {} disappeared", id),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    member.leave().await
}
