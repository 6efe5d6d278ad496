mod audio;
mod button_bridge;
mod call_api;
mod config;
mod events;
mod indicator;
mod media;
mod panel_bridge;
mod protocol;
mod recording;
mod session;
mod signaling;

use audio::{AlsaAudio, AudioConfig};
use button_bridge::ButtonBridge;
use call_api::CallApi;
use config::Config;
use events::SessionEvent;
use mac_address::get_mac_address;
use media::RelayMediaClient;
use panel_bridge::PanelBridge;
use session::{CallSessionManager, Collaborators, SessionConfig};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use uuid::Uuid;

// 无法获取 MAC 地址时，生成的 UUID 保存在这里，保证重启后身份一致
const DEVICE_ID_FILE: &str = "callbox_device_id.txt";

fn resolve_device_id(configured: &str) -> String {
    if configured != "unknown-device" {
        return configured.to_string();
    }
    if let Ok(Some(mac)) = get_mac_address() {
        return mac.to_string().to_lowercase();
    }
    if let Ok(content) = std::fs::read_to_string(DEVICE_ID_FILE) {
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            log::info!("Loaded device id from {}", DEVICE_ID_FILE);
            return trimmed.to_string();
        }
    }
    let id = Uuid::new_v4().to_string();
    match std::fs::write(DEVICE_ID_FILE, &id) {
        Ok(()) => log::info!("Generated device id {}, saved to {}", id, DEVICE_ID_FILE),
        Err(e) => log::warn!("Failed to save device id to {}: {}", DEVICE_ID_FILE, e),
    }
    id
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    config.device_id = resolve_device_id(&config.device_id);
    log::info!(
        "{} {} starting as {} (device {})",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        config.user_id,
        config.device_id
    );

    // 所有组件共用一个事件通道，会话管理器是唯一的消费者
    let (tx, rx) = mpsc::channel::<SessionEvent>(100);

    // 面板桥：状态灯输出 + 控制命令输入
    let panel_bridge = Arc::new(PanelBridge::new(&config, tx.clone()).await?);
    let panel_bridge_clone = panel_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = panel_bridge_clone.run().await {
            log::error!("PanelBridge error: {}", e);
        }
    });

    // 按键桥
    let button_bridge = ButtonBridge::new(&config, tx.clone()).await?;
    tokio::spawn(async move {
        if let Err(e) = button_bridge.run().await {
            log::error!("ButtonBridge error: {}", e);
        }
    });

    // 信令链路
    let (signaling_link, signaling_handle) = signaling::link(&config, tx.clone());
    tokio::spawn(signaling_link.run());

    let collaborators = Collaborators {
        initiator: Arc::new(CallApi::new(&config)?),
        signaling: Arc::new(signaling_handle),
        media: Arc::new(RelayMediaClient::new(&config, tx.clone())),
        audio: Box::new(AlsaAudio::new(AudioConfig::from(&config))),
        indicator: panel_bridge,
    };
    let manager = CallSessionManager::new(SessionConfig::from(&config), tx.clone(), collaborators);

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Received Ctrl+C, shutting down...");
                let _ = tx.send(SessionEvent::Shutdown).await;
            }
            Err(e) => log::error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    manager.run(rx).await;
    log::info!("Bye");
    Ok(())
}
