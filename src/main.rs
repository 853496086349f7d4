//! Sensor Telemetry Streamer CLI
//!
//! Streams sensor pings to a collector and controls a running stream.

use chrono::Utc;
use clap::{Parser, Subcommand};
use sensor_telemetry_streamer::{
    config::{interval_from_secs, Config, IntervalPreset, StreamOptions, TransportMode},
    engine::{Collaborators, StreamEngine, STATS_FILE},
    payload::{DeviceInfo, PayloadBuilder, SessionIdentity, TickInput, MANUAL_REASON},
    sensors::{BrightnessSource, SysfsBacklight},
    store::Snapshot,
    transparency::create_shared_log_with_persistence,
    transport::{BlockingRequestClient, Endpoint, TransportError},
    DATA_DECLARATION, VERSION,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sensor-stream")]
#[command(version = VERSION)]
#[command(about = "Stream sensor telemetry pings to a collector", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start streaming pings
    Start {
        /// Collector base URL (overrides the config file)
        #[arg(long)]
        endpoint: Option<String>,

        /// Parameter segment appended to the endpoint
        #[arg(long)]
        segment: Option<String>,

        /// Transport mode (persistent or request)
        #[arg(long)]
        transport: Option<String>,

        /// Seconds between pings
        #[arg(long, conflicts_with = "rate")]
        interval: Option<f64>,

        /// Sampling rate preset (60hz, 20hz, 10hz or 4hz)
        #[arg(long)]
        rate: Option<String>,

        /// Sensors to include (motion, location, light, image, or all)
        #[arg(long)]
        sensors: Option<String>,

        /// Keep streaming while backgrounded, where the host supports it
        #[arg(long)]
        background: bool,
    },

    /// Pause a running stream
    Pause,

    /// Resume a paused stream
    Resume,

    /// Show configuration and emission statistics
    Status,

    /// Display the data declaration
    Declaration,

    /// Show configuration
    Config,

    /// Send a single ping with a message over HTTP
    Send {
        /// Message placed in the ping
        message: String,

        /// Collector URL (http or https)
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Send a burst of pings over HTTP, stopping at the first failure
    Burst {
        /// Number of pings
        #[arg(long, default_value = "10")]
        count: u32,

        /// Seconds between pings
        #[arg(long, default_value = "0.1")]
        interval: f64,

        /// Message placed in every ping
        #[arg(long, default_value = "burst")]
        message: String,

        /// Collector URL (http or https)
        #[arg(long)]
        endpoint: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            endpoint,
            segment,
            transport,
            interval,
            rate,
            sensors,
            background,
        } => {
            cmd_start(StartArgs {
                endpoint,
                segment,
                transport,
                interval,
                rate,
                sensors,
                background,
            });
        }
        Commands::Pause => {
            cmd_pause();
        }
        Commands::Resume => {
            cmd_resume();
        }
        Commands::Status => {
            cmd_status();
        }
        Commands::Declaration => {
            cmd_declaration();
        }
        Commands::Config => {
            cmd_config();
        }
        Commands::Send { message, endpoint } => {
            cmd_send(&message, endpoint);
        }
        Commands::Burst {
            count,
            interval,
            message,
            endpoint,
        } => {
            cmd_burst(count, interval, &message, endpoint);
        }
    }
}

struct StartArgs {
    endpoint: Option<String>,
    segment: Option<String>,
    transport: Option<String>,
    interval: Option<f64>,
    rate: Option<String>,
    sensors: Option<String>,
    background: bool,
}

/// Fold command-line overrides into the stored config.
fn apply_start_args(config: &mut Config, args: &StartArgs) -> Result<(), String> {
    if let Some(ref endpoint) = args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(ref segment) = args.segment {
        config.endpoint_segment = Some(segment.clone()).filter(|s| !s.trim().is_empty());
    }
    if let Some(ref transport) = args.transport {
        config.transport = transport.parse().map_err(|e| format!("{e}"))?;
    }
    if let Some(secs) = args.interval {
        config.interval = interval_from_secs(secs).map_err(|e| format!("{e}"))?;
    }
    if let Some(ref rate) = args.rate {
        config.interval = IntervalPreset::from_label(rate)
            .ok_or_else(|| format!("Unknown rate '{rate}' (use 60hz, 20hz, 10hz or 4hz)"))?
            .interval();
    }
    if let Some(ref sensors) = args.sensors {
        config.options = StreamOptions::from_csv(sensors);
    }
    if args.background {
        config.allow_background = true;
    }
    config.validate().map_err(|e| format!("{e}"))
}

fn cmd_start(args: StartArgs) {
    println!("Sensor Telemetry Streamer v{VERSION}");
    println!();

    let mut config = match Config::load_or_init() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Could not load config ({e}), using defaults");
            Config::default()
        }
    };
    if let Err(e) = apply_start_args(&mut config, &args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }
    // Persist overrides so pause/resume and later polls see the same settings.
    if let Err(e) = config.save() {
        eprintln!("Warning: Could not save config: {e}");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("sensor-stream")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error creating runtime: {e}");
            std::process::exit(1);
        }
    };

    let engine = match StreamEngine::new(
        config.clone(),
        Collaborators::default(),
        runtime.handle().clone(),
    ) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    println!("Starting stream...");
    println!("  Endpoint: {}", engine.endpoint());
    println!("  Transport: {}", config.transport);
    println!("  Interval: {:.3}s", config.interval.as_secs_f64());
    println!("  Sensors: {}", config.options.describe());
    println!(
        "  Background streaming: {}",
        if config.allow_background {
            "allowed"
        } else {
            "not allowed"
        }
    );
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    if config.paused {
        println!("Streaming is currently paused.");
        println!("Run `sensor-stream resume` to start streaming.");
        println!();
    } else {
        engine.start();
    }

    let mut last_config_check = std::time::Instant::now();
    let mut last_status = engine.status();

    while running.load(Ordering::SeqCst) {
        // Periodically reload config so `sensor-stream pause/resume` can control a running stream.
        if last_config_check.elapsed() >= Duration::from_secs(1) {
            match Config::load() {
                Ok(cfg) => {
                    if cfg.paused != config.paused {
                        println!();
                        println!(
                            "{}",
                            if cfg.paused {
                                "Pausing stream..."
                            } else {
                                "Resuming stream..."
                            }
                        );
                    }
                    if let Err(e) = engine.apply_config(&cfg) {
                        eprintln!("Warning: Ignoring config change: {e}");
                    } else {
                        config = cfg;
                    }
                }
                Err(e) => tracing::debug!("Config reload failed: {e}"),
            }
            last_config_check = std::time::Instant::now();

            let status = engine.status();
            if status != last_status {
                println!("[{}] {status}", Utc::now().format("%H:%M:%S"));
                last_status = status;
            }
        }

        thread::sleep(Duration::from_millis(100));
    }

    println!();
    println!("Stopping stream...");
    engine.shutdown();

    println!();
    println!("{}", engine.log().summary());
}

fn cmd_pause() {
    let mut config = Config::load().unwrap_or_default();
    config.paused = true;
    if let Err(e) = config.save() {
        eprintln!("Error saving config: {e}");
        std::process::exit(1);
    }
    println!("Streaming paused. Use 'sensor-stream resume' to continue.");
}

fn cmd_resume() {
    let mut config = Config::load().unwrap_or_default();
    config.paused = false;
    if let Err(e) = config.save() {
        eprintln!("Error saving config: {e}");
        std::process::exit(1);
    }
    println!("Streaming resumed.");
}

fn cmd_status() {
    let config = Config::load().unwrap_or_default();

    println!("Sensor Telemetry Streamer Status");
    println!("================================");
    println!();

    println!("Configuration:");
    match config.target_url() {
        Ok(url) => println!("  Endpoint: {url}"),
        Err(e) => println!("  Endpoint: invalid ({e})"),
    }
    println!("  Transport: {}", config.transport);
    println!("  Interval: {:.3}s", config.interval.as_secs_f64());
    println!("  Sensors: {}", config.options.describe());
    println!("  Background streaming: {}", config.allow_background);
    println!("  Paused: {}", config.paused);
    println!();

    let backlight = SysfsBacklight::detect();
    println!(
        "Screen brightness source: {}",
        if backlight.is_available() {
            "backlight ✓"
        } else {
            "unavailable ✗"
        }
    );
    println!();

    let stats_path = config.data_path.join(STATS_FILE);
    if stats_path.exists() {
        let log = create_shared_log_with_persistence(stats_path);
        println!("Cumulative {}", log.summary());
    } else {
        println!("No previous stream data found.");
    }
}

fn cmd_declaration() {
    println!("{DATA_DECLARATION}");
}

fn cmd_config() {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
}

fn cmd_send(message: &str, endpoint: Option<String>) {
    cmd_burst(1, 0.0, message, endpoint);
}

/// Send `count` pings through one-shot requests. Stops at the first
/// non-success status.
fn cmd_burst(count: u32, interval_secs: f64, message: &str, endpoint: Option<String>) {
    let config = Config::load().unwrap_or_default();
    let url = match endpoint {
        Some(url) => url,
        None => match config.target_url() {
            Ok(url) => url,
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        },
    };
    let endpoint = match Endpoint::parse(&url, TransportMode::Request) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Pass an http(s) collector with --endpoint.");
            std::process::exit(1);
        }
    };
    let pause = if interval_secs > 0.0 {
        Duration::try_from_secs_f64(interval_secs).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    };

    let client = match BlockingRequestClient::new(config.request_timeout) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let builder = PayloadBuilder::new(
        config.telemetry_id.clone(),
        SessionIdentity::new(config.client_id.clone()),
        DeviceInfo::detect(config.app_channel.clone()),
    );
    let brightness = SysfsBacklight::detect();
    let log = create_shared_log_with_persistence(config.data_path.join(STATS_FILE));
    let options = StreamOptions::none();

    let mut delivered = 0;
    for seq in 1..=u64::from(count) {
        let input = TickInput {
            options: &options,
            motion: None,
            snapshot: Snapshot::default(),
            screen_brightness: brightness.read(),
            seq,
            timestamp: Utc::now(),
            endpoint: endpoint.as_str(),
            reason: MANUAL_REASON,
            message: Some(message),
        };
        let ping = builder.build(&input);
        let body = match PayloadBuilder::serialize(&ping) {
            Ok(body) => body,
            Err(e) => {
                eprintln!("Error: {e}");
                log.record_dropped();
                continue;
            }
        };

        match client.send(&endpoint, body) {
            Ok(status) => {
                println!("[{seq}/{count}] HTTP {status}");
                if let Some(event) = ping.events.first() {
                    log.record_ping(&event.extra);
                }
                log.record_manual_send();
                delivered += 1;
            }
            Err(TransportError::Http { status }) => {
                eprintln!("[{seq}/{count}] Collector answered HTTP {status}, stopping");
                break;
            }
            Err(e) => {
                eprintln!("[{seq}/{count}] {e}, stopping");
                break;
            }
        }

        if seq < u64::from(count) && !pause.is_zero() {
            thread::sleep(pause);
        }
    }

    if let Err(e) = log.save() {
        eprintln!("Warning: Could not save stream stats: {e}");
    }
    println!("Delivered {delivered} of {count} ping(s) to {endpoint}");
    if delivered < count {
        std::process::exit(1);
    }
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Warning: Could not set Ctrl+C handler: {e}");
    }
}
