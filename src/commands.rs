//! Client subcommands that drive a running node through its API

use std::error::Error;
use std::time::Duration;
use trackmesh_core::{
    config::{AddCommand, ApiArgs, GetCommand, PeersCommand},
    ClientConfig, Commands, ContentHash, ProtocolClient, TrackMetadata,
};

// Downloads may wait on a full race across the mesh
const ADMIN_TIMEOUT: Duration = Duration::from_secs(120);

pub async fn run(command: Commands) -> Result<(), Box<dyn Error>> {
    let client = ProtocolClient::new(ClientConfig {
        request_timeout: ADMIN_TIMEOUT,
        retries: 0,
    })?;

    match command {
        Commands::Start(_) => Err("start runs a node, not a client command".into()),
        Commands::Add(cmd) => add(&client, cmd).await,
        Commands::Get(cmd) => get(&client, cmd).await,
        Commands::List(args) => list(&client, args).await,
        Commands::Peers(cmd) => peers(&client, cmd).await,
        Commands::Stats(args) => stats(&client, args).await,
    }
}

async fn add(client: &ProtocolClient, cmd: AddCommand) -> Result<(), Box<dyn Error>> {
    let data = tokio::fs::read(&cmd.file).await?;
    let metadata = TrackMetadata {
        title: cmd.title,
        artist: cmd.artist,
        album: cmd.album,
        duration_seconds: cmd.duration_seconds,
    };

    let track = client.upload_track(&cmd.api.api, data, &metadata).await?;
    println!("{}", track.content_hash());
    println!("{} ({} bytes)", track.title(), track.size_bytes());
    Ok(())
}

async fn get(client: &ProtocolClient, cmd: GetCommand) -> Result<(), Box<dyn Error>> {
    let hash: ContentHash = cmd
        .hash
        .parse()
        .map_err(|e| format!("Invalid content hash '{}': {}", cmd.hash, e))?;
    let data = client.download(&cmd.api.api, &hash).await?;

    tokio::fs::write(&cmd.output, &data).await?;
    println!("Saved {} bytes to {}", data.len(), cmd.output.display());
    Ok(())
}

async fn list(client: &ProtocolClient, args: ApiArgs) -> Result<(), Box<dyn Error>> {
    let tracks = client.local_tracks(&args.api).await?;
    if tracks.is_empty() {
        println!("No tracks");
        return Ok(());
    }

    for track in tracks {
        let mut line = format!("{}  {:>10}  {}", track.content_hash(), track.size_bytes(), track.title());
        if let Some(artist) = track.artist() {
            line.push_str(&format!(" / {}", artist));
        }
        println!("{}", line);
    }
    Ok(())
}

async fn peers(client: &ProtocolClient, cmd: PeersCommand) -> Result<(), Box<dyn Error>> {
    if let Some(addr) = cmd.add {
        let peer = client.add_peer(&cmd.api.api, &addr).await?;
        println!("Added peer {} at {}", peer.peer_id, peer.addr());
        return Ok(());
    }

    let peers = client.list_peers(&cmd.api.api).await?;
    if peers.is_empty() {
        println!("No peers");
        return Ok(());
    }

    for peer in peers {
        println!(
            "{}  {}  last_seen={}  failures={}  tracks={}",
            peer.peer_id,
            peer.addr(),
            peer.last_seen,
            peer.consecutive_failures,
            peer.known_hashes.len()
        );
    }
    Ok(())
}

async fn stats(client: &ProtocolClient, args: ApiArgs) -> Result<(), Box<dyn Error>> {
    let stats = client.stats(&args.api).await?;
    let m = &stats.metrics;

    println!("Node:          {}", stats.node_id);
    println!("Address:       {}", stats.listen_addr);
    println!("State:         {}", stats.phase);
    println!("Tracks:        {}", stats.track_count);
    println!("Peers:         {} ({} pending)", stats.peer_count, stats.pending_peers);
    println!("Stored:        {} entries, {} bytes", stats.stored_entries, stats.stored_bytes);
    println!("Local hits:    {}", m.local_hits);
    println!("Remote:        {} fetched, {} failed", m.remote_fetches, m.remote_failures);
    println!("Gossip rounds: {}", m.gossip_rounds);
    println!("Uptime:        {}s", m.uptime_seconds);
    Ok(())
}
