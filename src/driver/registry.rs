// 存储挂载表

use super::baidu_netdisk::BaiduNetdisk;
use super::local::LocalStorage;
use super::open123::Open123;
use super::StorageDriver;
use crate::common::Clock;
use crate::config::{ClientConfig, StorageConfig};
use crate::error::{GatewayError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// 按挂载 ID 查找驱动
#[derive(Default)]
pub struct StorageRegistry {
    drivers: DashMap<String, Arc<dyn StorageDriver>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置初始化全部驱动
    pub fn from_config(
        storages: &[StorageConfig],
        client: &ClientConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let registry = Self::new();
        for storage in storages {
            let driver: Arc<dyn StorageDriver> = match storage {
                StorageConfig::Open123(c) => Arc::new(Open123::new(c, client, clock.clone())?),
                StorageConfig::BaiduNetdisk(c) => Arc::new(BaiduNetdisk::new(c, client, clock.clone())?),
                StorageConfig::Local(c) => Arc::new(LocalStorage::new(c)?),
            };
            info!(
                "存储已挂载: id={}, driver={}, 能力={:?}",
                driver.id(),
                driver.kind(),
                driver.capabilities()
            );
            registry.insert(driver);
        }
        Ok(registry)
    }

    pub fn insert(&self, driver: Arc<dyn StorageDriver>) {
        self.drivers.insert(driver.id().to_string(), driver);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn StorageDriver>> {
        self.drivers
            .get(id)
            .map(|d| Arc::clone(d.value()))
            .ok_or_else(|| GatewayError::StorageNotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.drivers.iter().map(|e| e.key().clone()).collect()
    }

    /// 关闭全部驱动
    pub async fn shutdown(&self) {
        let drivers: Vec<_> = self.drivers.iter().map(|e| Arc::clone(e.value())).collect();
        for driver in drivers {
            driver.shutdown().await;
        }
    }
}
