use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    device: Device,
    network: Network,
    audio: Audio,
    session: Session,
    recording: Recording,
    panel: Panel,
    button: Button,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Device {
    user_id: String,
    device_id: String,
}

#[derive(Deserialize)]
struct Network {
    signaling_url: String,
    api_url: String,
    api_token: String,
    media_url: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    capture_channels: u32,
    playback_channels: u32,
    frame_duration_ms: u32,
    capture_gain: f32,
    playback_period_size: usize,
    opus_bitrate: i32,
    uplink_capacity: usize,
    downlink_capacity: usize,
}

#[derive(Deserialize)]
struct Session {
    error_reset_ms: u64,
}

#[derive(Deserialize)]
struct Recording {
    window_ms: u64,
}

#[derive(Deserialize)]
struct Panel {
    local_ip: String,
    local_port: u16,
    remote_ip: String,
    remote_port: u16,
    buffer_size: usize,
}

#[derive(Deserialize)]
struct Button {
    local_ip: String,
    local_port: u16,
    buffer_size: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    println!("cargo:rustc-env=USER_ID={}", config.device.user_id);
    println!("cargo:rustc-env=DEVICE_ID={}", config.device.device_id);

    // 网络配置
    println!("cargo:rustc-env=SIGNALING_URL={}", config.network.signaling_url);
    println!("cargo:rustc-env=API_URL={}", config.network.api_url);
    println!("cargo:rustc-env=API_TOKEN={}", config.network.api_token);
    println!("cargo:rustc-env=MEDIA_URL={}", config.network.media_url);

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=CAPTURE_CHANNELS={}", config.audio.capture_channels);
    println!("cargo:rustc-env=PLAYBACK_CHANNELS={}", config.audio.playback_channels);
    println!("cargo:rustc-env=FRAME_DURATION_MS={}", config.audio.frame_duration_ms);
    println!("cargo:rustc-env=CAPTURE_GAIN={}", config.audio.capture_gain);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);
    println!("cargo:rustc-env=OPUS_BITRATE={}", config.audio.opus_bitrate);
    println!("cargo:rustc-env=UPLINK_CAPACITY={}", config.audio.uplink_capacity);
    println!("cargo:rustc-env=DOWNLINK_CAPACITY={}", config.audio.downlink_capacity);

    println!("cargo:rustc-env=ERROR_RESET_MS={}", config.session.error_reset_ms);
    println!("cargo:rustc-env=RECORDING_WINDOW_MS={}", config.recording.window_ms);

    // 面板（LED）进程
    println!("cargo:rustc-env=PANEL_LOCAL_IP={}", config.panel.local_ip);
    println!("cargo:rustc-env=PANEL_LOCAL_PORT={}", config.panel.local_port);
    println!("cargo:rustc-env=PANEL_REMOTE_IP={}", config.panel.remote_ip);
    println!("cargo:rustc-env=PANEL_REMOTE_PORT={}", config.panel.remote_port);
    println!("cargo:rustc-env=PANEL_BUFFER_SIZE={}", config.panel.buffer_size);

    // 按键进程
    println!("cargo:rustc-env=BUTTON_LOCAL_IP={}", config.button.local_ip);
    println!("cargo:rustc-env=BUTTON_LOCAL_PORT={}", config.button.local_port);
    println!("cargo:rustc-env=BUTTON_BUFFER_SIZE={}", config.button.buffer_size);
}
