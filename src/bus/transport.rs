// ==========================================
// 智能工厂MES - 发布/订阅传输层
// ==========================================
// 职责: 按事件类型分通道的消息扇出
// 通道命名: 事件类型 T → "events:{lowercase(T)}"；
//           参数流使用独立通道 "parameter-collected"
// 投递语义: 尽力投递（fire-and-forget）——仅送达当前在线订阅方，
//           离线订阅方不补投，跨订阅方不保证顺序。
//           需要顺序/可靠历史的消费方走事件存储回查接口。
//           此弱保证为既定设计，不得私自升级为持久化队列语义。
// ==========================================

use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// 事件通道前缀
pub const EVENT_CHANNEL_PREFIX: &str = "events:";

/// 参数采集流独立通道
pub const PARAMETER_CHANNEL: &str = "parameter-collected";

/// 事件类型对应的通道名
pub fn event_channel(event_type: &str) -> String {
    format!("{}{}", EVENT_CHANNEL_PREFIX, event_type.to_lowercase())
}

/// 传输层订阅句柄
///
/// 每个句柄独立消费通道上的全部消息（广播语义）。
pub struct TransportSubscription {
    channel: String,
    receiver: broadcast::Receiver<String>,
}

impl TransportSubscription {
    pub fn new(channel: String, receiver: broadcast::Receiver<String>) -> Self {
        Self { channel, receiver }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 接收下一条消息
    ///
    /// 消费过慢导致 Lagged 时跳过丢失的消息继续接收（丢失数记告警日志）。
    /// 通道关闭（取消订阅或传输层销毁）时返回错误，由接收循环退出。
    pub async fn recv(&mut self) -> BusResult<String> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Ok(message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("订阅消费滞后，跳过 {} 条消息: channel={}", n, self.channel);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(BusError::Transport {
                        channel: self.channel.clone(),
                        message: "通道已关闭".to_string(),
                    });
                }
            }
        }
    }
}

/// 消息传输接口
///
/// 总线只依赖此窄契约，便于测试替换失败传输实现。
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// 向通道发布一条消息，返回送达的订阅方数量
    async fn publish(&self, channel: &str, message: String) -> BusResult<usize>;

    /// 订阅通道（通道不存在时创建）
    fn subscribe(&self, channel: &str) -> TransportSubscription;

    /// 销毁通道（所有订阅句柄随之收到关闭信号）
    fn unsubscribe(&self, channel: &str);

    /// 通道当前订阅方数量
    fn subscriber_count(&self, channel: &str) -> usize;

    /// 当前活跃通道数量
    fn channel_count(&self) -> usize;
}

/// 通道条目
///
/// 持有一个内部接收端，保证通道在没有业务订阅方时发布不报错。
struct ChannelEntry {
    sender: broadcast::Sender<String>,
    _keepalive: broadcast::Receiver<String>,
}

/// 基于 tokio broadcast 的进程内传输实现
pub struct BroadcastTransport {
    channels: DashMap<String, ChannelEntry>,
    capacity: usize,
}

impl BroadcastTransport {
    /// # 参数
    /// - capacity: 单通道缓冲容量，超出后滞后订阅方丢失最旧消息
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                let (sender, keepalive) = broadcast::channel(self.capacity);
                tracing::debug!("传输通道已创建: channel={}", channel);
                ChannelEntry {
                    sender,
                    _keepalive: keepalive,
                }
            })
            .sender
            .clone()
    }
}

#[async_trait]
impl MessageTransport for BroadcastTransport {
    async fn publish(&self, channel: &str, message: String) -> BusResult<usize> {
        let sender = self.sender_for(channel);
        match sender.send(message) {
            // 扣除内部 keepalive 接收端
            Ok(receivers) => Ok(receivers.saturating_sub(1)),
            Err(e) => Err(BusError::Transport {
                channel: channel.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn subscribe(&self, channel: &str) -> TransportSubscription {
        let receiver = self.sender_for(channel).subscribe();
        TransportSubscription::new(channel.to_string(), receiver)
    }

    fn unsubscribe(&self, channel: &str) {
        if self.channels.remove(channel).is_some() {
            tracing::debug!("传输通道已销毁: channel={}", channel);
        }
    }

    fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|entry| entry.sender.receiver_count().saturating_sub(1))
            .unwrap_or(0)
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
