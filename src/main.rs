use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use quickrt::config::{GcMode, HEAP_SIZE_DIVISOR, RuntimeConfig, StatsFormat, parse_memory_option};
use quickrt::vm::{GcStats, JValue, ThreadHandle};
use quickrt::{ExecutionContext, Program, Runtime, RuntimeError};

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum GcModeArg {
    #[default]
    Stw,
    Concurrent,
}

impl From<GcModeArg> for GcMode {
    fn from(arg: GcModeArg) -> Self {
        match arg {
            GcModeArg::Stw => GcMode::Stw,
            GcModeArg::Concurrent => GcMode::Concurrent,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum StatsFormatArg {
    #[default]
    Human,
    Json,
}

impl From<StatsFormatArg> for StatsFormat {
    fn from(arg: StatsFormatArg) -> Self {
        match arg {
            StatsFormatArg::Human => StatsFormat::Human,
            StatsFormatArg::Json => StatsFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "quickrt")]
#[command(about = "Run register-based managed bytecode programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program file
    Run {
        /// The program file (TOML)
        file: PathBuf,

        /// Runtime configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Heap limit, e.g. 512k or 16m (multiple of 1024)
        #[arg(long, value_parser = parse_heap_limit)]
        heap_limit: Option<usize>,

        /// GC mode (stw, concurrent)
        #[arg(long, value_enum)]
        gc_mode: Option<GcModeArg>,

        /// Print GC statistics
        #[arg(long)]
        gc_stats: bool,

        /// Format of printed statistics
        #[arg(long, value_enum, default_value = "human")]
        stats_format: StatsFormatArg,

        /// Log every dispatched instruction
        #[arg(long)]
        trace: bool,
    },
    /// Load and verify a program file without running it
    Check {
        /// The program file (TOML)
        file: PathBuf,
    },
}

fn parse_heap_limit(s: &str) -> Result<usize, String> {
    parse_memory_option(s, HEAP_SIZE_DIVISOR)
        .ok_or_else(|| format!("invalid heap size `{}` (expected e.g. 512k, 16m)", s))
}

fn init_tracing(trace: bool) {
    let filter = if trace {
        tracing_subscriber::EnvFilter::new("quickrt=trace")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quickrt=warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            config,
            heap_limit,
            gc_mode,
            gc_stats,
            stats_format,
            trace,
        } => {
            init_tracing(trace);
            let mut config = match config {
                Some(path) => match RuntimeConfig::load(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::FAILURE;
                    }
                },
                None => RuntimeConfig::default(),
            };
            if heap_limit.is_some() {
                config.heap_limit = heap_limit;
            }
            if let Some(mode) = gc_mode {
                config.gc_mode = mode.into();
            }
            config.gc_stats |= gc_stats;

            match run_file(&file, config, stats_format.into()) {
                Ok(true) => {}
                Ok(false) => return ExitCode::FAILURE,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
        Commands::Check { file } => {
            init_tracing(false);
            if let Err(e) = check_file(&file) {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
            println!("Program is valid.");
        }
    }

    ExitCode::SUCCESS
}

/// Load a program into a fresh runtime.
fn load(path: &Path, config: RuntimeConfig) -> quickrt::Result<(Arc<Runtime>, Program)> {
    let program = Program::load(path)?;
    let runtime = Runtime::new(config)?;
    runtime.load_program(&program)?;
    Ok((runtime, program))
}

fn check_file(path: &Path) -> quickrt::Result<()> {
    let (runtime, program) = load(path, RuntimeConfig::default())?;
    if runtime.method_by_name(&program.entry).is_none() {
        return Err(RuntimeError::UnknownMethod(program.entry));
    }
    for thread in &program.threads {
        if runtime.method_by_name(&thread.method).is_none() {
            return Err(RuntimeError::UnknownMethod(thread.method.clone()));
        }
    }
    Ok(())
}

/// Run the entry method and the program's extra threads. Returns false
/// when managed code ended with an uncaught exception.
fn run_file(path: &Path, config: RuntimeConfig, stats_format: StatsFormat) -> quickrt::Result<bool> {
    let print_stats = config.gc_stats;
    let (runtime, program) = load(path, config)?;
    let mut ctx = runtime.attach_current_thread("main");

    let mut workers: Vec<(String, ThreadHandle)> = Vec::new();
    for spec in &program.threads {
        for _ in 0..spec.count {
            let args = spec.args.iter().map(|&n| JValue::Int(n)).collect();
            workers.push((spec.method.clone(), runtime.spawn(&spec.method, args)?));
        }
    }

    let result = ctx.invoke(&program.entry, &[]);
    let mut ok = report(&ctx, "main", result);
    for (name, handle) in workers {
        let result = handle.join(&mut ctx);
        ok &= report(&ctx, &name, result);
    }

    if print_stats {
        print_gc_stats(&runtime.gc_stats(), stats_format);
    }
    Ok(ok)
}

/// Print a thread's result. Host-level errors other than uncaught
/// exceptions are propagated as failures too.
fn report(ctx: &ExecutionContext, thread: &str, result: quickrt::Result<JValue>) -> bool {
    match result {
        Ok(value) => {
            if let Some(text) = format_value(ctx, value) {
                println!("{}", text);
            }
            true
        }
        Err(RuntimeError::UncaughtException {
            class,
            message,
            trace,
        }) => {
            if message.is_empty() {
                eprintln!("Exception in thread \"{}\" {}", thread, class);
            } else {
                eprintln!("Exception in thread \"{}\" {}: {}", thread, class, message);
            }
            for frame in trace {
                eprintln!("  at {}", frame);
            }
            false
        }
        Err(e) => {
            eprintln!("error: thread \"{}\": {}", thread, e);
            false
        }
    }
}

fn format_value(ctx: &ExecutionContext, value: JValue) -> Option<String> {
    match value {
        JValue::Void => None,
        JValue::Int(n) => Some(n.to_string()),
        JValue::Wide(n) => Some(n.to_string()),
        JValue::Ref(None) => Some("null".to_string()),
        JValue::Ref(Some(r)) => {
            let runtime = ctx.runtime();
            let class = runtime.classes().name_of(runtime.heap().class_of(r));
            Some(format!("{}@{}", class, r.raw()))
        }
    }
}

fn print_gc_stats(stats: &GcStats, format: StatsFormat) {
    match format {
        StatsFormat::Human => eprintln!(
            "[GC] Collections: {}, Freed: {} objects ({} bytes), Total pause: {}us, Max pause: {}us",
            stats.cycles, stats.objects_freed, stats.bytes_freed, stats.total_pause_us, stats.max_pause_us
        ),
        StatsFormat::Json => match serde_json::to_string(stats) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => eprintln!("error: failed to serialize GC stats: {}", e),
        },
    }
}
