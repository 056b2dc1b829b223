// gbedge-deviced: GB28181 边缘设备守护进程
// 读取 CLI/TOML 配置，向平台注册并响应拉流与语音广播；
// 采集/编码侧通过 MediaEdgeAgent 句柄投递媒体帧

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use gbedge_media::g711::G711Law;
use gbedge_sip::agent::{AgentCallbacks, AgentConfig, MediaEdgeAgent};
use gbedge_sip::device::DeviceIdentity;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML 配置文件路径（CLI 参数优先于文件）
    #[arg(long)]
    config: Option<String>,

    /// 本机 IP
    #[arg(long)]
    local_ip: Option<String>,

    /// 平台 IP
    #[arg(long)]
    server_ip: Option<String>,

    /// 平台 SIP 端口
    #[arg(long)]
    server_port: Option<u16>,

    /// 平台国标编码
    #[arg(long)]
    server_id: Option<String>,

    /// 平台 SIP 域
    #[arg(long)]
    server_domain: Option<String>,

    /// 设备国标编码
    #[arg(long)]
    device_id: Option<String>,

    /// 设备序列号
    #[arg(long)]
    serial_number: Option<String>,

    /// 设备显示名（鉴权用户名）
    #[arg(long)]
    device_name: Option<String>,

    /// 注册口令
    #[arg(long)]
    password: Option<String>,

    /// 经度
    #[arg(long)]
    longitude: Option<f64>,

    /// 纬度
    #[arg(long)]
    latitude: Option<f64>,

    /// 音频律：pcmu 或 pcma
    #[arg(long)]
    audio_law: Option<String>,
}

/// TOML 侧的设备配置，字段与 CLI 一一对应。
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    local_ip: Option<String>,
    server_ip: Option<String>,
    server_port: Option<u16>,
    server_id: Option<String>,
    server_domain: Option<String>,
    device_id: Option<String>,
    serial_number: Option<String>,
    device_name: Option<String>,
    password: Option<String>,
    longitude: Option<f64>,
    latitude: Option<f64>,
    audio_law: Option<String>,
}

fn load_file_config(path: Option<&str>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let settings = config::Config::builder()
        .add_source(config::File::new(path, config::FileFormat::Toml))
        .build()
        .with_context(|| format!("failed to load config {path}"))?;
    settings
        .try_deserialize()
        .with_context(|| format!("invalid config {path}"))
}

fn resolve(args: Args) -> Result<(DeviceIdentity, G711Law)> {
    let file = load_file_config(args.config.as_deref())?;

    fn pick<T>(cli: Option<T>, file: Option<T>, name: &str) -> Result<T> {
        cli.or(file)
            .with_context(|| format!("missing required parameter: {name}"))
    }

    let identity = DeviceIdentity {
        local_ip: pick(args.local_ip, file.local_ip, "local_ip")?,
        server_ip: pick(args.server_ip, file.server_ip, "server_ip")?,
        server_port: args.server_port.or(file.server_port).unwrap_or(5060),
        server_id: pick(args.server_id, file.server_id, "server_id")?,
        server_domain: pick(args.server_domain, file.server_domain, "server_domain")?,
        device_id: pick(args.device_id, file.device_id, "device_id")?,
        serial_number: args
            .serial_number
            .or(file.serial_number)
            .unwrap_or_default(),
        device_name: pick(args.device_name, file.device_name, "device_name")?,
        password: pick(args.password, file.password, "password")?,
        longitude: args.longitude.or(file.longitude).unwrap_or(0.0),
        latitude: args.latitude.or(file.latitude).unwrap_or(0.0),
    };

    let law = match args
        .audio_law
        .or(file.audio_law)
        .unwrap_or_else(|| "pcmu".to_string())
        .to_ascii_lowercase()
        .as_str()
    {
        "pcmu" => G711Law::Pcmu,
        "pcma" => G711Law::Pcma,
        other => anyhow::bail!("unknown audio law {other}, expected pcmu or pcma"),
    };

    Ok((identity, law))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let (identity, audio_law) = resolve(args)?;
    tracing::info!(
        target: "deviced",
        "device {} ({}) -> platform {}:{}",
        identity.device_id,
        identity.device_name,
        identity.server_ip,
        identity.server_port
    );

    let mut agent_config = AgentConfig::new(identity);
    agent_config.audio_law = audio_law;

    let agent = Arc::new(MediaEdgeAgent::new(agent_config).context("connect platform failed")?);

    agent.set_callbacks(AgentCallbacks {
        event: Some(Arc::new(|code, message| {
            tracing::info!(target: "deviced", "agent event {}: {}", code, message);
        })),
        g711: Some(Arc::new(|frame| {
            tracing::debug!(target: "deviced", "broadcast g711 frame, {} bytes", frame.len());
        })),
        pcm: Some(Arc::new(|samples| {
            tracing::debug!(target: "deviced", "broadcast pcm frame, {} samples", samples.len());
        })),
    });

    agent.start().context("start event loop failed")?;
    agent.do_register();

    // 媒体帧由采集/编码侧经 agent.write_video_frame / write_audio_frame 投递；
    // 守护进程本体只维持信令生命周期
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write as _;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_resolve_cli_only() {
        let args = Args::parse_from([
            "gbedge-deviced",
            "--local-ip",
            "192.168.3.131",
            "--server-ip",
            "111.198.10.15",
            "--server-port",
            "15060",
            "--server-id",
            "34020000002000000001",
            "--server-domain",
            "3402000000",
            "--device-id",
            "34020000001320011118",
            "--device-name",
            "EdgeCam01",
            "--password",
            "1234qwer",
            "--audio-law",
            "pcma",
        ]);
        let (identity, law) = resolve(args).unwrap();
        assert_eq!(identity.server_port, 15060);
        assert_eq!(identity.device_id, "34020000001320011118");
        assert_eq!(law, G711Law::Pcma);
    }

    #[test]
    fn test_resolve_merges_file_and_cli() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "local_ip = \"10.0.0.2\"\n\
             server_ip = \"10.0.0.1\"\n\
             server_id = \"34020000002000000001\"\n\
             server_domain = \"3402000000\"\n\
             device_id = \"34020000001320011118\"\n\
             device_name = \"EdgeCam01\"\n\
             password = \"from-file\"\n\
             longitude = 116.3975\n"
        )
        .unwrap();

        let args = Args::parse_from([
            "gbedge-deviced",
            "--config",
            file.path().to_str().unwrap(),
            "--password",
            "from-cli",
        ]);
        let (identity, law) = resolve(args).unwrap();
        // CLI 覆盖文件，文件补齐其余
        assert_eq!(identity.password, "from-cli");
        assert_eq!(identity.local_ip, "10.0.0.2");
        assert_eq!(identity.server_port, 5060);
        assert_eq!(identity.longitude, 116.3975);
        assert_eq!(law, G711Law::Pcmu);
    }

    #[test]
    fn test_resolve_missing_parameter() {
        let args = Args::parse_from(["gbedge-deviced", "--local-ip", "10.0.0.2"]);
        let err = resolve(args).unwrap_err();
        assert!(err.to_string().contains("missing required parameter"));
    }
}
