use std::collections::HashSet;
use std::fs::File;
use std::io::BufRead;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use shm_log::{Log, LogConfig, LogError, LogStatus};

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    let cli = Cli::parse();

    #[cfg(feature = "shm-log-tracing")]
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = cli.tuning.config();
    let result = match cli.command {
        LogCommand::Append { stores, records } => append(&stores, &config, records),
        LogCommand::Trim { stores } => trim(&stores, &config),
        LogCommand::Status { stores } => status(&stores, &config),
        LogCommand::Stress(stress) => run_stress(&cli.tuning, &config, stress),
        LogCommand::StressWriter {
            stores,
            writer,
            count,
            size,
        } => stress_writer(&stores, &config, writer, count, size),
    };

    if let Err(err) = result {
        eprintln!("shm-log: {err}");
        process::exit(1);
    }
}

/// Append to, trim or inspect a log shared between processes.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: LogCommand,
}

#[derive(Args, Clone)]
struct Tuning {
    /// Size of the chunks the data store grows by, used only when creating the log.
    #[arg(long, global = true)]
    chunk_size: Option<u64>,

    /// Chunks this process keeps mapped at most.
    #[arg(long, global = true)]
    max_resident_chunks: Option<usize>,

    /// Milliseconds to wait for another process to finish creating the log.
    #[arg(long, global = true)]
    init_timeout_ms: Option<u64>,

    /// Milliseconds to wait for the structural lock before giving up.
    #[arg(long, global = true)]
    lock_timeout_ms: Option<u64>,
}

#[derive(Args, Clone)]
struct Stores {
    #[arg(help = "The metadata store, created if missing")]
    meta: PathBuf,

    #[arg(help = "The data store records are appended to")]
    data: PathBuf,
}

#[derive(Subcommand)]
enum LogCommand {
    /// Append each argument as a record, or each line of stdin if there are none.
    Append {
        #[command(flatten)]
        stores: Stores,

        records: Vec<String>,
    },
    /// Shrink the data store down to the chunk holding the cursor.
    Trim {
        #[command(flatten)]
        stores: Stores,
    },
    /// Print the shared record.
    Status {
        #[command(flatten)]
        stores: Stores,
    },
    /// Append concurrently from several child processes and check the result.
    Stress(Stress),
    /// One child of `stress`.
    #[command(hide = true)]
    StressWriter {
        #[command(flatten)]
        stores: Stores,

        #[arg(long)]
        writer: u32,

        #[arg(long)]
        count: u32,

        #[arg(long)]
        size: usize,
    },
}

#[derive(Args)]
struct Stress {
    #[command(flatten)]
    stores: Stores,

    /// Number of writer processes.
    #[arg(long, default_value_t = 4)]
    writers: u32,

    /// Records appended by each writer.
    #[arg(long, default_value_t = 100)]
    count: u32,

    /// Size of every record, at least the 8 bytes of its header.
    #[arg(long, default_value_t = 128, value_parser = clap::value_parser!(u64).range(8..))]
    size: u64,
}

impl Tuning {
    fn config(&self) -> LogConfig {
        let mut config = LogConfig::default();

        if let Some(chunk_size) = self.chunk_size {
            config = config.with_chunk_size(chunk_size);
        }

        if let Some(resident) = self.max_resident_chunks {
            config = config.with_max_resident_chunks(resident);
        }

        if let Some(ms) = self.init_timeout_ms {
            config = config.with_init_timeout(Duration::from_millis(ms));
        }

        if let Some(ms) = self.lock_timeout_ms {
            config = config.with_lock_timeout(Duration::from_millis(ms));
        }

        config
    }

    /// The same options as command line arguments, for child processes.
    fn to_args(&self) -> Vec<String> {
        let mut args = vec![];

        if let Some(chunk_size) = self.chunk_size {
            args.push(format!("--chunk-size={chunk_size}"));
        }

        if let Some(resident) = self.max_resident_chunks {
            args.push(format!("--max-resident-chunks={resident}"));
        }

        if let Some(ms) = self.init_timeout_ms {
            args.push(format!("--init-timeout-ms={ms}"));
        }

        if let Some(ms) = self.lock_timeout_ms {
            args.push(format!("--lock-timeout-ms={ms}"));
        }

        args
    }
}

impl Stores {
    fn open(&self, config: &LogConfig) -> Result<Log, LogError> {
        Log::create_or_attach(&self.meta, &self.data, config)
    }
}

fn append(stores: &Stores, config: &LogConfig, records: Vec<String>) -> CliResult {
    let log = stores.open(config)?;

    let write = |record: &[u8]| -> CliResult {
        let at = log.append(record)?;
        println!("{}..{}", at.start, at.end);
        Ok(())
    };

    if records.is_empty() {
        let stdin = std::io::stdin();
        for line in stdin.lock().split(b'\n') {
            write(&line?)?;
        }
    } else {
        for record in &records {
            write(record.as_bytes())?;
        }
    }

    log.close();
    Ok(())
}

fn trim(stores: &Stores, config: &LogConfig) -> CliResult {
    let log = stores.open(config)?;
    let committed = log.trim()?;
    println!("committed_size: {committed}");
    Ok(())
}

fn status(stores: &Stores, config: &LogConfig) -> CliResult {
    let log = stores.open(config)?;
    print_status(&log.status());
    Ok(())
}

fn print_status(status: &LogStatus) {
    let LogStatus {
        version,
        ready,
        locked,
        lock_owner,
        panicked,
        fenced,
        page_size,
        chunk_size,
        committed_size,
        cursor,
    } = status;

    println!("version: {version}");
    println!("ready: {ready}");
    println!("locked: {locked}");
    if *locked {
        println!("lock_owner: {lock_owner}");
    }
    println!("panicked: {panicked}");
    println!("fenced: {fenced}");
    println!("page_size: {page_size}");
    println!("chunk_size: {chunk_size}");
    println!("committed_size: {committed_size}");
    println!("cursor: {cursor}");
}

fn run_stress(tuning: &Tuning, config: &LogConfig, stress: Stress) -> CliResult {
    let Stress {
        stores,
        writers,
        count,
        size,
    } = stress;

    let size = usize::try_from(size)?;
    let exe = std::env::current_exe()?;
    let started = Instant::now();

    let children = (0..writers)
        .map(|writer| {
            Command::new(&exe)
                .args(tuning.to_args())
                .arg("stress-writer")
                .arg(&stores.meta)
                .arg(&stores.data)
                .arg(format!("--writer={writer}"))
                .arg(format!("--count={count}"))
                .arg(format!("--size={size}"))
                .spawn()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut failed = 0;
    for mut child in children {
        if !child.wait()?.success() {
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(format!("{failed} of {writers} writers failed").into());
    }

    let log = stores.open(config)?;
    let status = log.status();
    let expected = u64::from(writers) * u64::from(count) * size as u64;
    eprintln!(
        "{} records of {size} bytes in {:?}",
        u64::from(writers) * u64::from(count),
        started.elapsed()
    );
    print_status(&status);

    if status.cursor != expected {
        return Err(format!("cursor at {} after appending {expected} bytes", status.cursor).into());
    }

    verify(&stores.data, writers, count, size)
}

fn stress_writer(
    stores: &Stores,
    config: &LogConfig,
    writer: u32,
    count: u32,
    size: usize,
) -> CliResult {
    let log = stores.open(config)?;

    for seq in 0..count {
        log.append(&stress_record(writer, seq, size))?;
    }

    Ok(())
}

/// Records start with the writer and its sequence number, the rest is filled with a byte derived
/// from both.
fn stress_record(writer: u32, seq: u32, size: usize) -> Vec<u8> {
    let mut record = vec![writer.wrapping_mul(31).wrapping_add(seq) as u8; size];
    record[..4].copy_from_slice(&writer.to_le_bytes());
    record[4..8].copy_from_slice(&seq.to_le_bytes());
    record
}

/// Every record must appear exactly once and intact. All records have the same size, so they
/// are found at multiples of it.
fn verify(data: &Path, writers: u32, count: u32, size: usize) -> CliResult {
    let file = File::open(data)?;
    let total = u64::from(writers) * u64::from(count);
    let mut seen = HashSet::new();
    let mut buf = vec![0; size];

    for index in 0..total {
        file.read_exact_at(&mut buf, index * size as u64)?;

        let writer = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let seq = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if writer >= writers || seq >= count || buf != stress_record(writer, seq, size) {
            return Err(format!("corrupt record at offset {}", index * size as u64).into());
        }

        if !seen.insert((writer, seq)) {
            return Err(format!("record {seq} of writer {writer} appears twice").into());
        }
    }

    println!("verified: {total} records");
    Ok(())
}
