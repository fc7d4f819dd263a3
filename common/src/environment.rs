use serde::{Deserialize, Serialize};

use crate::application::AppId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvCategory {
    SparkConf,
    JvmInfo,
    HadoopConf,
    SystemProps,
    MetricsProps,
    ClasspathEntries,
}

impl EnvCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvCategory::SparkConf => "spark_conf",
            EnvCategory::JvmInfo => "jvm_info",
            EnvCategory::HadoopConf => "hadoop_conf",
            EnvCategory::SystemProps => "system_props",
            EnvCategory::MetricsProps => "metrics_props",
            EnvCategory::ClasspathEntries => "classpath_entries",
        }
    }
}

/// Un par clave/valor del entorno de la aplicación. Inmutable una vez escrito.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// "appId:category:key"
    pub id: String,
    pub app_id: AppId,
    pub category: EnvCategory,
    pub key: String,
    pub value: String,
}

impl EnvironmentConfig {
    pub fn new(app_id: &str, category: EnvCategory, key: &str, value: String) -> Self {
        Self {
            id: format!("{}:{}:{}", app_id, category.as_str(), key),
            app_id: app_id.to_string(),
            category,
            key: key.to_string(),
            value,
        }
    }
}
