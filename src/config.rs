pub mod settings;

pub use settings::{
    generate_default_config, parse_memory_list, ClusterConfig, NimbusSettings, SchedulerSettings,
    Settings,
};
