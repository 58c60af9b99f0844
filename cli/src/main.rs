//! Runs a small demonstration program over every node of a node list,
//! all inside this one process.

use anyhow::{bail, Context};
use clap::Parser;
use pgas::{from_payload, to_payload, Config, Node, NodeList, ThreadContext, ThreadId};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pgas-cli", version, about = "Simulate a PGAS run in one process")]
struct Args {
    /// Comma separated `host[:port]` entries, one per thread. Repeating an
    /// entry puts another thread on that node. The first entry is the root.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "localhost:7101,localhost:7102,localhost:7101,localhost:7102"
    )]
    nodes: Vec<String>,
}

/// Every thread checks in, splits into parity groups, hears its group's
/// broadcast and reads its right neighbour's square.
async fn demo(ctx: ThreadContext) -> pgas::Result<String> {
    let me = ctx.my_id();
    ctx.storage().put("square", to_payload(&(me * me))?, &[])?;
    ctx.barrier().await?;

    let team = ctx.join(if me % 2 == 0 { "even" } else { "odd" }).await?;
    team.barrier().await?;
    if team.my_id() == 0 {
        let banner = format!("{} led by thread {}", team.name(), me);
        team.broadcast("banner", to_payload(&banner)?, &[]).await?;
    }
    team.barrier().await?;
    let banner: String = from_payload(&ctx.storage().get("banner", &[])?)?;

    let right = (me + 1) % ctx.thread_count() as ThreadId;
    let square: u32 = from_payload(&ctx.get(right, "square", &[]).await?)?;
    ctx.barrier().await?;

    Ok(format!(
        "node {} | {} as member {} of {} | thread {} squared is {}",
        ctx.physical_id(),
        banner,
        team.my_id(),
        team.thread_count(),
        right,
        square
    ))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::from_env().context("reading PGAS_* settings")?;
    let list = NodeList::parse(&args.nodes, config.default_port)?;
    info!(
        "simulating {} nodes running {} threads",
        list.len(),
        list.thread_count()
    );

    let mut nodes = Vec::with_capacity(list.len());
    let mut root = None;
    for index in 0..list.len() {
        let mut spec = list.spec_for(index)?;
        if spec.root.is_some() {
            spec.root = root.clone();
        }
        let node = Node::bind(config.clone(), spec)
            .await
            .with_context(|| format!("binding node {}", list.endpoints()[index].address()))?;
        if root.is_none() {
            // the root may have been given port 0
            root = Some(format!(
                "{}:{}",
                list.endpoints()[0].hostname,
                node.local_addr().port()
            ));
        }
        nodes.push(node);
    }

    let runs: Vec<_> = nodes
        .into_iter()
        .map(|node| tokio::spawn(node.run(demo)))
        .collect();

    let mut outcomes = Vec::new();
    for run in runs {
        outcomes.extend(run.await.context("node task died")??);
    }
    outcomes.sort_by_key(|(thread_id, _)| *thread_id);

    let mut failed = 0;
    for (thread_id, outcome) in outcomes {
        match outcome {
            Ok(line) => println!("thread {}: {}", thread_id, line),
            Err(e) => {
                failed += 1;
                println!("thread {}: failed: {}", thread_id, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} threads failed", failed);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
