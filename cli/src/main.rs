use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    process::{Command, ExitCode},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sweep::{
    mesh::endpoint::MeshConfig,
    search::{
        self, run_cluster, run_local, scenario, ArtifactConfig, DpSolver, ErrorKind,
        ExchangeConfig, RangeDistribution, ResultSummary, RunConfig, Solver, StateMachineConfig,
    },
};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sweep", version)]
#[command(about = "Exhaustive search over availability patterns across cooperating workers")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run every worker in this process over an in-process mesh
    Local {
        #[arg(short, long, default_value_t = 1)]
        workers: usize,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run one rank of a cluster connected over QUIC
    Node {
        #[arg(long)]
        rank: usize,
        /// Listening address of every rank, in rank order
        #[arg(long, value_delimiter = ',', required = true)]
        peers: Vec<SocketAddr>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Start a whole cluster on this host, one `node` process per rank
    Launch {
        #[arg(short, long)]
        workers: usize,
        #[arg(long, default_value_t = 47100)]
        base_port: u16,
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
        host: IpAddr,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Solve one scenario file and print its schedule
    Solve {
        /// File holding one line of whitespace separated 0/1 flags
        file: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Slots per scenario (1 to 30)
    #[arg(short, long)]
    bits: u32,
    /// Solver threads per worker
    #[arg(short, long, default_value_t = 1)]
    threads: usize,
    /// Write one result row per scenario
    #[arg(long)]
    save_results: bool,
    /// Merged result file
    #[arg(long)]
    results: Option<PathBuf>,
    /// Directory for checkpoints, metrics and result parts
    #[arg(long, default_value = ".")]
    metrics_dir: PathBuf,
    /// Wall clock budget of each worker's search, in seconds
    #[arg(long)]
    budget: Option<f64>,
    /// Scenarios between cache exchange rounds
    #[arg(long, default_value_t = 1000)]
    exchange_interval: u64,
    /// Turn cache exchange rounds off
    #[arg(long)]
    no_exchange: bool,
    /// Only enumerate the first this many scenarios
    #[arg(long)]
    limit: Option<u64>,
    /// Let rank 0 send every rank its range instead of computing it locally
    #[arg(long)]
    push_ranges: bool,
}

impl RunArgs {
    fn config(&self) -> Result<RunConfig> {
        let exchange = ExchangeConfig::builder()
            .enabled(!self.no_exchange)
            .interval(self.exchange_interval)
            .build();
        let artifacts = ArtifactConfig::builder()
            .output_dir(self.metrics_dir.clone())
            .save_results(self.save_results || self.results.is_some())
            .build();
        let artifacts = ArtifactConfig {
            results_path: self.results.clone(),
            ..artifacts
        };
        let budget = self
            .budget
            .map(|secs| Duration::try_from_secs_f64(secs).context("invalid --budget"))
            .transpose()?;
        Ok(RunConfig {
            time_budget: budget,
            scenario_limit: self.limit,
            ..RunConfig::builder()
                .horizon(self.bits)
                .threads(self.threads)
                .exchange(exchange)
                .artifacts(artifacts)
                .distribution(if self.push_ranges {
                    RangeDistribution::Pushed
                } else {
                    RangeDistribution::Computed
                })
                .build()
        })
    }

    /// The same flags, for a child `node` process.
    fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--bits".to_owned(),
            self.bits.to_string(),
            "--threads".to_owned(),
            self.threads.to_string(),
            "--metrics-dir".to_owned(),
            self.metrics_dir.display().to_string(),
            "--exchange-interval".to_owned(),
            self.exchange_interval.to_string(),
        ];
        if self.save_results {
            args.push("--save-results".to_owned());
        }
        if let Some(results) = &self.results {
            args.extend(["--results".to_owned(), results.display().to_string()]);
        }
        if let Some(budget) = self.budget {
            args.extend(["--budget".to_owned(), budget.to_string()]);
        }
        if self.no_exchange {
            args.push("--no-exchange".to_owned());
        }
        if let Some(limit) = self.limit {
            args.extend(["--limit".to_owned(), limit.to_string()]);
        }
        if self.push_ranges {
            args.push("--push-ranges".to_owned());
        }
        args
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_status(&e))
        }
    }
}

fn exit_status(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<search::Error>().map(search::Error::kind) {
        Some(ErrorKind::Config) => 2,
        Some(ErrorKind::Io | ErrorKind::Input) => 3,
        Some(ErrorKind::Transport) => 4,
        Some(ErrorKind::Internal) | None => match error.downcast_ref::<search::ConfigError>() {
            Some(_) => 2,
            None => 1,
        },
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Cmd::Local { workers, run } => {
            let config = run.config()?;
            let report = run_local(&config, workers).context("local run failed")?;
            print_summary(report.run_id, report.processed(), &report.summary());
            if let Some(global) = report.global() {
                println!(
                    "throughput  {:.1} scenarios/s, load balance {:.3}",
                    global.throughput, global.load_balance_ratio
                );
            }
            if let Some(results) = report.coordinator().and_then(|c| c.results.as_ref()) {
                println!("results     {} rows in {}", results.rows, results.path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Node { rank, peers, run } => {
            let config = run.config()?;
            let mesh = MeshConfig::builder()
                .rank(rank)
                .fingerprint(config.fingerprint(peers.len()))
                .peers(peers)
                .build();
            let runtime = tokio::runtime::Runtime::new().context("could not start the runtime")?;
            let report = runtime
                .block_on(run_cluster(&config, &mesh))
                .with_context(|| format!("rank {rank} failed"))?;
            if report.rank == 0 {
                print_summary(report.run_id, report.snapshot.processed, &report.snapshot.summary);
            }
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Launch {
            workers,
            base_port,
            host,
            run,
        } => launch(workers, base_port, host, &run, cli.verbose),
        Cmd::Solve { file } => {
            let scenario = scenario::load(&file)
                .with_context(|| format!("could not load {}", file.display()))?;
            let machine = std::sync::Arc::new(StateMachineConfig::standard());
            let result = DpSolver::new(machine).solve(&scenario.flags());
            let states: Vec<String> = result.states.iter().map(ToString::to_string).collect();
            println!("scenario    {scenario}");
            println!("class       {:?}", scenario.class());
            println!("states      {}", states.join(" "));
            println!("cost        {:.2}", result.total_cost);
            println!("valid       {}", if result.is_valid { "yes" } else { "no" });
            println!("critical    {}", result.critical_slots);
            println!("transitions {}", result.transitions());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn launch(
    workers: usize,
    base_port: u16,
    host: IpAddr,
    run: &RunArgs,
    verbose: bool,
) -> Result<ExitCode> {
    // fail here rather than in every child
    run.config()?.validate(workers).context("invalid run")?;
    let peers: Vec<String> = (0..workers)
        .map(|rank| {
            let port = base_port
                .checked_add(rank as u16)
                .context("port range exhausted")?;
            Ok(SocketAddr::new(host, port).to_string())
        })
        .collect::<Result<_>>()?;
    let exe = std::env::current_exe().context("could not locate the sweep binary")?;

    let mut children = Vec::with_capacity(workers);
    for rank in 0..workers {
        let mut command = Command::new(&exe);
        if verbose {
            command.arg("--verbose");
        }
        command
            .arg("node")
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--peers")
            .arg(peers.join(","))
            .args(run.to_args());
        let child = command
            .spawn()
            .with_context(|| format!("could not start rank {rank}"))?;
        children.push((rank, child));
    }
    info!(workers, "cluster started");

    let mut worst = 0u8;
    for (rank, mut child) in children {
        let status = child
            .wait()
            .with_context(|| format!("lost track of rank {rank}"))?;
        let code = status.code().map_or(1, |code| code.clamp(0, 255) as u8);
        if code != 0 {
            warn!(rank, code, "rank failed");
        }
        worst = worst.max(code);
    }
    Ok(ExitCode::from(worst))
}

fn print_summary(run_id: u64, processed: u64, summary: &ResultSummary) {
    println!("run         {run_id:016x}");
    println!("processed   {processed}");
    println!("valid       {} (invalid {})", summary.valid, summary.invalid);
    println!("mean cost   {:.2}", summary.mean_cost());
    if let Some(best) = summary.best {
        println!("best        {:.2} at #{}", best.cost, best.scenario);
    }
    if let Some(worst) = summary.worst {
        println!("worst       {:.2} at #{}", worst.cost, worst.scenario);
    }
    println!(
        "classes     {} critical, {} optimal, {} mixed",
        summary.critical, summary.optimal, summary.mixed
    );
}
