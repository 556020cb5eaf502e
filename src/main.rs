use anyhow::bail;
use clap::Parser;
use rs_leech::peer;
use rs_leech::swarm;
use rs_leech::torrent::magnet::MagnetLink;
use rs_leech::torrent::metainfo::TorrentFile;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "rsl", about = "A leeching BitTorrent client")]
struct Cli {
    #[clap(long, help = "path to a *.torrent file", conflicts_with = "magnet")]
    torrent: Option<PathBuf>,
    #[clap(long, help = "magnet link to download")]
    magnet: Option<String>,
    #[clap(short, long, default_value = "6881")]
    port: u16,
    #[clap(long, default_value = ".", help = "directory for downloaded data")]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Cli::parse();

    // Identify ourselves once; trackers and peers see the same id.
    let our_id = peer::generate_peer_id();

    let (meta, trackers) = match (&args.torrent, &args.magnet) {
        (Some(path), _) => {
            let torrent = TorrentFile::from_path(path)?;
            (torrent.meta, torrent.announce.into_iter().collect())
        }
        (None, Some(uri)) => {
            let link = MagnetLink::parse(uri)?;
            let meta = swarm::fetch_metadata(
                link.info_hash,
                &link.trackers,
                our_id,
                args.port,
                &args.dir,
            )
            .await?;
            (meta, link.trackers)
        }
        (None, None) => bail!("either --torrent or --magnet is required"),
    };

    let path = swarm::download(Arc::new(meta), &trackers, our_id, args.port, &args.dir).await?;
    println!("{}", path.display());
    Ok(())
}
