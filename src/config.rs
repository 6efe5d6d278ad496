use crate::audio::frame::frame_len;

#[derive(Debug, Clone)]
pub struct Config {
    // 设备标识（device_id 可在运行时修改）
    pub user_id: &'static str,
    pub device_id: String,

    // 网络配置
    pub signaling_url: &'static str,
    pub api_url: &'static str,
    pub api_token: &'static str,
    pub media_url: &'static str,

    // 音频配置
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub sample_rate: u32,
    pub capture_channels: u32,
    pub playback_channels: u32,
    pub frame_duration_ms: u32,
    pub capture_gain: f32,
    pub playback_period_size: usize,
    pub opus_bitrate: i32,
    pub uplink_capacity: usize,
    pub downlink_capacity: usize,

    // 通话会话
    pub error_reset_ms: u64,
    pub recording_window_ms: u64,

    // 面板进程（指示灯 + 控制命令）
    pub panel_local_ip: &'static str,
    pub panel_local_port: u16,
    pub panel_remote_ip: &'static str,
    pub panel_remote_port: u16,
    pub panel_buffer_size: usize,

    // 按键进程
    pub button_local_ip: &'static str,
    pub button_local_port: u16,
    pub button_buffer_size: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        let config = Self {
            user_id: env!("USER_ID"),
            device_id: env!("DEVICE_ID").to_string(),

            signaling_url: env!("SIGNALING_URL"),
            api_url: env!("API_URL"),
            api_token: env!("API_TOKEN"),
            media_url: env!("MEDIA_URL"),

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            sample_rate: env!("SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse SAMPLE_RATE")?,
            capture_channels: env!("CAPTURE_CHANNELS").parse()
                .map_err(|_| "Failed to parse CAPTURE_CHANNELS")?,
            playback_channels: env!("PLAYBACK_CHANNELS").parse()
                .map_err(|_| "Failed to parse PLAYBACK_CHANNELS")?,
            frame_duration_ms: env!("FRAME_DURATION_MS").parse()
                .map_err(|_| "Failed to parse FRAME_DURATION_MS")?,
            capture_gain: env!("CAPTURE_GAIN").parse()
                .map_err(|_| "Failed to parse CAPTURE_GAIN")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
            opus_bitrate: env!("OPUS_BITRATE").parse()
                .map_err(|_| "Failed to parse OPUS_BITRATE")?,
            uplink_capacity: env!("UPLINK_CAPACITY").parse()
                .map_err(|_| "Failed to parse UPLINK_CAPACITY")?,
            downlink_capacity: env!("DOWNLINK_CAPACITY").parse()
                .map_err(|_| "Failed to parse DOWNLINK_CAPACITY")?,

            error_reset_ms: env!("ERROR_RESET_MS").parse()
                .map_err(|_| "Failed to parse ERROR_RESET_MS")?,
            recording_window_ms: env!("RECORDING_WINDOW_MS").parse()
                .map_err(|_| "Failed to parse RECORDING_WINDOW_MS")?,

            panel_local_ip: env!("PANEL_LOCAL_IP"),
            panel_local_port: env!("PANEL_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse PANEL_LOCAL_PORT")?,
            panel_remote_ip: env!("PANEL_REMOTE_IP"),
            panel_remote_port: env!("PANEL_REMOTE_PORT").parse()
                .map_err(|_| "Failed to parse PANEL_REMOTE_PORT")?,
            panel_buffer_size: env!("PANEL_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse PANEL_BUFFER_SIZE")?,

            button_local_ip: env!("BUTTON_LOCAL_IP"),
            button_local_port: env!("BUTTON_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse BUTTON_LOCAL_PORT")?,
            button_buffer_size: env!("BUTTON_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse BUTTON_BUFFER_SIZE")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// 检查数值之间的约束，例如一帧至少要有一个采样
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.sample_rate == 0 {
            return Err("SAMPLE_RATE must be positive");
        }
        if frame_len(self.sample_rate, self.frame_duration_ms) == 0 {
            return Err("FRAME_DURATION_MS is shorter than one sample at SAMPLE_RATE");
        }
        if self.capture_channels == 0 || self.playback_channels == 0 {
            return Err("CAPTURE_CHANNELS and PLAYBACK_CHANNELS must be positive");
        }
        Ok(())
    }
}
