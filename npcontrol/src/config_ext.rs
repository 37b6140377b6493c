//! Extension to read the controller settings from `npconfig`.
//!
//! ```rust,ignore
//! use npconfig::get_config;
//! use npcontrol::NowPlayingConfigExt;
//!
//! let settings = get_config().get_controller_settings()?;
//! println!("priority: {}", settings.priority());
//! ```

use anyhow::{Context, Result};
use npconfig::Config;
use serde_yaml::Value;
use tracing::warn;

use crate::config::{ControllerSettings, NowPlayingConfig};
use crate::model::ServiceLinks;
use crate::priority::PriorityOrder;

const SECTION: &str = "nowplaying";

/// Adds now-playing accessors to [`npconfig::Config`].
pub trait NowPlayingConfigExt {
    /// The raw `nowplaying:` section. A section that does not deserialize is
    /// reported and replaced by the defaults.
    fn get_nowplaying_config(&self) -> Result<NowPlayingConfig>;

    /// The immutable snapshot handed to the controller at startup.
    fn get_controller_settings(&self) -> Result<ControllerSettings> {
        Ok(self.get_nowplaying_config()?.resolve())
    }

    fn set_priority_order(&self, order: &PriorityOrder) -> Result<()>;

    fn get_service_links(&self) -> Result<ServiceLinks>;

    fn set_service_links(&self, links: ServiceLinks) -> Result<()>;
}

impl NowPlayingConfigExt for Config {
    fn get_nowplaying_config(&self) -> Result<NowPlayingConfig> {
        let section = self.get_value(&[SECTION]).unwrap_or(Value::Null);
        match NowPlayingConfig::from_value(section) {
            Ok(config) => Ok(config),
            Err(err) => {
                warn!("Invalid '{SECTION}' configuration section, using defaults: {err}");
                Ok(NowPlayingConfig::default())
            }
        }
    }

    fn set_priority_order(&self, order: &PriorityOrder) -> Result<()> {
        self.set_value(&[SECTION, "priority_order"], Value::from(order.to_string()))
    }

    fn get_service_links(&self) -> Result<ServiceLinks> {
        Ok(self.get_nowplaying_config()?.links)
    }

    fn set_service_links(&self, links: ServiceLinks) -> Result<()> {
        let value = serde_yaml::to_value(links).context("serializing service links")?;
        self.set_value(&[SECTION, "links"], value)
    }
}
