use std::net::{IpAddr, Ipv4Addr};

use derivative::Derivative;
use genserve_core::ServableConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenerOption,
    /// Every servable is reachable under its `name` in the request `model` field.
    pub servables: Vec<ServableConfig>,
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ListenerOption {
    /// Ip to listen to.
    #[derivative(Default(value = "IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))"))]
    pub ip: IpAddr,
    /// Binding port.
    #[derivative(Default(value = "65530u16"))]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use genserve_core::PipelineType;

    use super::*;

    #[test]
    fn test_parse_config() {
        let config: Config = toml::from_str(
            r#"
            [listen]
            port = 8000

            [[servables]]
            name = "echo"
            models_path = "assets/models/echo"

            [[servables]]
            name = "npu"
            pipeline_type = "legacy"
            device = "NPU"
            max_prompt_length = 512
            "#,
        )
        .expect("test");
        assert_eq!(config.listen.port, 8000);
        assert_eq!(config.listen.ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.servables.len(), 2);
        assert_eq!(config.servables[0].pipeline_type, PipelineType::ContinuousBatching);
        assert_eq!(config.servables[1].pipeline_type, PipelineType::Legacy);
        assert_eq!(config.servables[1].max_prompt_length, 512);
    }
}
