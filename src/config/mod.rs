// ==========================================
// 智能工厂MES - 配置层
// ==========================================
// 职责: 骨干运行参数的加载、查询与缺省值管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

pub mod backbone_config;
pub mod config_manager;

pub use backbone_config::BackboneConfig;
pub use config_manager::ConfigManager;
