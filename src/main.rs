use anyhow::Context;
use audio_streamer::capture::{self, list_input_devices};
use audio_streamer::config::{
    CaptureConfig, ServerConfig, SourceKind, StreamerConfig, DEFAULT_CLIENT_QUEUE_DEPTH,
    DEFAULT_QUEUE_DEPTH,
};
use audio_streamer::types::{StreamFormat, DEFAULT_CHANNELS, DEFAULT_CHUNK_BYTES, DEFAULT_SAMPLE_RATE};
use audio_streamer::{chunk_channel, BroadcastServer, Shutdown};
use clap::Parser;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "audio-streamer")]
#[command(about = "Broadcast live PCM audio to any number of TCP/HTTP clients")]
#[command(long_about = "
Captures 16-bit PCM from an audio input and streams it to every connected
client as an endless WAV over HTTP.

EXAMPLES:
  # List capture devices
  audio-streamer --list-devices

  # Stream the default input on port 8080
  audio-streamer

  # Stereo 44.1kHz from a named device
  audio-streamer --device \"USB Audio\" --rate 44100 --channels 2

  # Replay a file instead of a device, forever
  audio-streamer --file test.wav --loop-file

  # Listen to the stream
  curl -s http://localhost:8080/ | aplay
")]
struct Args {
    /// Address and port to listen on
    #[arg(long, env = "STREAMER_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Capture device name (default: system default input)
    #[arg(long, env = "STREAMER_DEVICE")]
    device: Option<String>,

    /// Sample rate in Hz
    #[arg(long, env = "STREAMER_RATE", default_value_t = DEFAULT_SAMPLE_RATE)]
    rate: u32,

    /// Channel count
    #[arg(long, env = "STREAMER_CHANNELS", default_value_t = DEFAULT_CHANNELS)]
    channels: u16,

    /// Bytes per broadcast chunk (a whole number of frames)
    #[arg(long, env = "STREAMER_CHUNK_BYTES", default_value_t = DEFAULT_CHUNK_BYTES)]
    chunk_bytes: usize,

    /// Chunks buffered before the oldest is dropped
    #[arg(long, env = "STREAMER_QUEUE_DEPTH", default_value_t = DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,

    /// Per-client write timeout in milliseconds
    #[arg(long, env = "STREAMER_WRITE_TIMEOUT_MS", default_value_t = 1000)]
    write_timeout_ms: u64,

    /// Chunks a client may fall behind by before it is dropped
    #[arg(long, env = "STREAMER_CLIENT_QUEUE_DEPTH", default_value_t = DEFAULT_CLIENT_QUEUE_DEPTH)]
    client_queue_depth: usize,

    /// Replay a 16-bit PCM WAV file instead of capturing
    #[arg(long, env = "STREAMER_FILE")]
    file: Option<PathBuf>,

    /// Loop the replayed file
    #[arg(long, env = "STREAMER_LOOP_FILE", requires = "file")]
    loop_file: bool,

    /// List capture devices and exit
    #[arg(long)]
    list_devices: bool,
}

impl Args {
    fn into_config(self) -> StreamerConfig {
        let format = StreamFormat::new(self.rate, self.channels);
        let source = match self.file {
            Some(path) => SourceKind::WavFile {
                path,
                loop_audio: self.loop_file,
            },
            None => SourceKind::Device(self.device),
        };

        StreamerConfig {
            server: ServerConfig {
                listen_address: self.listen,
                write_timeout: Duration::from_millis(self.write_timeout_ms),
                client_queue_depth: self.client_queue_depth,
                format,
            },
            capture: CaptureConfig {
                source,
                format,
                chunk_bytes: self.chunk_bytes,
            },
            queue_depth: self.queue_depth,
        }
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.list_devices {
        return list_devices();
    }

    let config = args.into_config();
    config.validate().context("Invalid configuration")?;
    run(config)
}

fn run(config: StreamerConfig) -> anyhow::Result<()> {
    info!("🚀 Starting audio-streamer");

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("🛑 Received shutdown signal");
        signal.trigger();
    })
    .context("Failed to install signal handler")?;

    let (sender, receiver) = chunk_channel(config.queue_depth);
    let source_config = config.capture.clone();
    let producer = capture::spawn_producer(
        move || Ok(capture::open_source(&source_config)),
        config.capture.clone(),
        sender,
        shutdown.clone(),
    )
    .context("Failed to start capture thread")?;

    // The envelope must advertise what the device actually delivers
    let format = match producer.wait_ready() {
        Ok(format) => format,
        Err(e) => {
            let _ = producer.join();
            return Err(e).context("Audio capture failed to start");
        }
    };

    let server_config = ServerConfig {
        format,
        ..config.server
    };
    let server = match BroadcastServer::bind(server_config) {
        Ok(server) => server.with_shutdown(shutdown.clone()),
        Err(e) => {
            shutdown.trigger();
            let _ = producer.join();
            return Err(e.into());
        }
    };

    let served = server.run(receiver);

    // The server may have stopped on its own; make sure capture stops too
    shutdown.trigger();
    let produced = producer.join();

    let summary = served.context("Broadcast server failed")?;
    info!(
        "📊 Served {} client(s), broadcast {} chunk(s) / {} bytes",
        summary.accepted, summary.chunks_broadcast, summary.bytes_broadcast
    );

    match produced {
        Ok(stats) => {
            if stats.overruns > 0 || stats.chunks_evicted > 0 {
                warn!(
                    "⚠️ {} overrun(s), {} chunk(s) dropped from the queue",
                    stats.overruns, stats.chunks_evicted
                );
            }
            info!(
                "✅ Captured {} chunk(s) / {} bytes",
                stats.chunks_emitted, stats.bytes_emitted
            );
            Ok(())
        }
        Err(e) => {
            error!("❌ Audio capture stopped: {}", e);
            Err(e).context("Audio capture failed")
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    let devices = list_input_devices().context("Failed to enumerate audio devices")?;
    if devices.is_empty() {
        println!("No input devices found");
        return Ok(());
    }

    println!("Input devices:");
    for device in devices {
        println!(
            "  {}{}: {} channel(s), {}Hz, {}",
            device.name,
            if device.is_default { " (default)" } else { "" },
            device.channel_count,
            device.default_sample_rate,
            device.sample_format
        );
    }
    Ok(())
}
