//! ---
//! vdev_section: "01-core-functionality"
//! vdev_subsection: "binary"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Binary entrypoint for the virtual device."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use vdev_common::{
    init_tracing, DeviceConfig, DeviceSettings, LogFormat, LoggingConfig, MqttConfig,
    PlatformConfig,
};
use vdev_core::{
    compose_tx_message, DeliveryBudget, DeviceStateStore, EngineHandle, EngineMode,
    ProtocolEngine,
};
use vdev_logging::{channel_sink, FanoutSink, LogLevel, LogRecord, SharedSink, TracingSink};
use vdev_mqtt::{MqttOptions, MqttTransport};
use vdev_msg::MessageCodec;
use vdev_schema::AttributeSchema;
use vdev_security::{build_cipher, key_fingerprint};
use vdev_sim::{build_streams, demo_streams, StreamSpec, TrafficScheduler};

/// Pause between delivery and disconnect in publish-once mode.
const LINGER: Duration = Duration::from_millis(300);

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Virtual IoT device speaking the attribute protocol over MQTT",
    long_about = None
)]
struct Cli {
    #[arg(short = 'p', long, value_name = "FILE", help = "Platform JSON file [default: plat.json]")]
    platform: Option<PathBuf>,

    #[arg(short = 'd', long, value_name = "FILE", help = "Device JSON file [default: device.json]")]
    device: Option<PathBuf>,

    #[arg(short = 'D', long, help = "Override device_id from the device file")]
    device_id: Option<String>,

    #[arg(short = 'k', long, help = "Override enc_key from the device file")]
    enc_key: Option<String>,

    #[arg(
        long = "stream",
        value_name = "SPEC",
        help = "Synthetic stream: toggle:ATTR[:seed], counter:ATTR[:period_ms], pattern:STR[:ENUM], script:PATH"
    )]
    streams: Vec<StreamSpec>,

    #[arg(long, help = "Stream f_bool, f_num, f_str and f_enum when declared")]
    demo_streams: bool,

    #[arg(long = "loop", help = "Swap topics so that two devices talk to each other")]
    loop_mode: bool,

    #[arg(long, help = "Seed for random streams")]
    seed: Option<u64>,

    #[arg(long, help = "Print attribute changes and dropped messages to stdout")]
    console: bool,

    #[arg(long, value_enum, default_value_t = CliLogFormat::Pretty)]
    log_format: CliLogFormat,

    #[arg(long, value_name = "DIR", help = "Also write daily rolling log files here")]
    log_dir: Option<PathBuf>,

    #[arg(
        value_name = "NAME=VALUE",
        conflicts_with_all = ["streams", "demo_streams"],
        help = "Send once and exit. VALUE is JSON, so quote strings: f_str='\"text\"'"
    )]
    params: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Pretty,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Pretty => LogFormat::Pretty,
            CliLogFormat::Json => LogFormat::StructuredJson,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Subscribe,
    PublishOnce,
    PublishStream,
}

impl Cli {
    fn run_kind(&self) -> RunKind {
        if !self.params.is_empty() {
            RunKind::PublishOnce
        } else if !self.streams.is_empty() || self.demo_streams {
            RunKind::PublishStream
        } else {
            RunKind::Subscribe
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let logging = LoggingConfig {
        directory: cli.log_dir.clone(),
        format: cli.log_format.into(),
        file_prefix: None,
    };
    init_tracing("vdevd", &logging)?;

    let device = DeviceConfig::load(cli.device.as_deref())?;
    let platform = PlatformConfig::load(cli.platform.as_deref())?;
    let settings = DeviceSettings::resolve(&device, cli.device_id.clone(), cli.enc_key.clone())?;
    let schema = Arc::new(
        AttributeSchema::compile(&device.attribute_types)
            .context("error in device file attributeTypes")?,
    );
    let tracing: SharedSink = Arc::new(TracingSink::for_device(settings.device_id.clone()));
    let fanout = Arc::new(FanoutSink::new(vec![tracing]));
    if cli.console {
        let (forward, records) = channel_sink();
        fanout.attach(forward);
        tokio::spawn(print_console(records));
    }
    let sink: SharedSink = fanout;

    let cipher = if settings.enc_enable {
        Some(
            build_cipher(settings.enc_scheme, &settings.enc_key)
                .context("unable to initialise payload cipher")?,
        )
    } else {
        None
    };
    let kind = cli.run_kind();
    let mode = match kind {
        RunKind::Subscribe => EngineMode::Subscribe,
        RunKind::PublishOnce => {
            EngineMode::PublishOnce(compose_tx_message(cli.params.as_slice(), &*sink)?)
        }
        RunKind::PublishStream => {
            let mut streams = build_streams(&cli.streams, &schema, cli.seed)?;
            if cli.demo_streams {
                streams.extend(demo_streams(&schema, cli.seed));
            }
            if streams.is_empty() {
                return Err(anyhow!("no stream applies to the declared attributes"));
            }
            EngineMode::PublishStream(TrafficScheduler::new(streams).with_sink(sink.clone()))
        }
    };

    let transport = Arc::new(MqttTransport::new(mqtt_options(
        &platform.mqtt,
        &settings.device_id,
    )));
    info!(
        device = %settings.device_id,
        host = %platform.mqtt.host,
        port = platform.mqtt.port,
        encrypted = settings.enc_enable,
        scheme = %settings.enc_scheme,
        key = %key_fingerprint(&settings.enc_key),
        loop_mode = cli.loop_mode,
        mode = ?kind,
        "starting virtual device"
    );

    let store = Arc::new(DeviceStateStore::new(schema.clone()).with_sink(sink.clone()));
    let codec = MessageCodec::new(schema, cipher);
    let handle = ProtocolEngine::new(settings.device_id.clone(), codec, store, transport, mode)
        .with_loop_mode(cli.loop_mode)
        .with_sink(sink)
        .start()
        .await
        .with_context(|| {
            format!(
                "unable to start device on {}:{}",
                platform.mqtt.host, platform.mqtt.port
            )
        })?;

    match kind {
        RunKind::PublishOnce => finish_publish_once(handle).await,
        RunKind::Subscribe | RunKind::PublishStream => run_until_interrupted(handle).await,
    }
}

async fn print_console(mut records: mpsc::UnboundedReceiver<LogRecord>) {
    while let Some(record) = records.recv().await {
        if let Some(line) = console_line(&record) {
            println!("{line}");
        }
    }
}

fn console_line(record: &LogRecord) -> Option<String> {
    match (record.get("attribute"), record.get("value")) {
        (Some(attribute), Some(value)) if record.message == "attribute written" => {
            Some(format!("{attribute} = {value}"))
        }
        _ if record.level >= LogLevel::Warn => Some(record.to_string()),
        _ => None,
    }
}

fn mqtt_options(mqtt: &MqttConfig, device_id: &str) -> MqttOptions {
    let client_id = mqtt
        .client_id
        .clone()
        .unwrap_or_else(|| format!("vdev-{device_id}"));
    MqttOptions::new(mqtt.host.clone(), mqtt.port, client_id)
        .with_credentials(mqtt.user.clone(), mqtt.pass.clone())
        .with_keep_alive(Duration::from_secs(u64::from(mqtt.keep_alive_secs)))
}

async fn finish_publish_once(handle: EngineHandle) -> Result<()> {
    if !handle.wait_for_delivery(DeliveryBudget::default()).await {
        warn!("message delivery not confirmed; disconnecting anyway");
    }
    tokio::time::sleep(LINGER).await;
    let metrics = handle.stop().await?;
    info!(sent = metrics.sent, dropped = metrics.dropped, "done");
    Ok(())
}

async fn run_until_interrupted(mut handle: EngineHandle) -> Result<()> {
    println!("Press CTRL+C to quit");
    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("unable to listen for ctrl-c")?;
            info!("ctrl-c received; shutting down");
        }
        _ = handle.stopped() => warn!("engine stopped on its own"),
    }
    let metrics = handle.stop().await?;
    info!(
        sent = metrics.sent,
        received = metrics.received,
        dropped = metrics.dropped,
        "done"
    );
    Ok(())
}
