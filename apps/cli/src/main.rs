//! # saftbus-ctl
//!
//! saftbus 守护进程的管理工具。
//!
//! ```bash
//! # 守护进程版本
//! saftbus-ctl hello
//!
//! # 已注册对象与槽位占用
//! saftbus-ctl status
//!
//! # 开启统计，稍后查看计数与信号飞行时间
//! saftbus-ctl stats on
//! saftbus-ctl state
//!
//! # 直接调用方法 / 读取属性
//! saftbus-ctl call /de/gsi/saftbus de.gsi.saftbus.Daemon Echo s:hello u32:7
//! saftbus-ctl get /de/gsi/saftbus de.gsi.saftbus.Daemon Version
//! ```

mod value_arg;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use saftbus::{BusConfig, ProxyConnection, Value};
use saftbus_protocol::{BusState, BusStatus};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// saftbus 管理工具
#[derive(Parser, Debug)]
#[command(name = "saftbus-ctl")]
#[command(about = "Administrative client for the saftbus daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// socket 基础路径（默认: $SAFTBUS_SOCKET_PATH 或 /var/run/saftbus/saftbus）
    #[arg(long, global = true)]
    socket_base: Option<PathBuf>,

    /// socket 池大小（默认: $SAFTBUS_POOL_SIZE 或 32）
    #[arg(long, global = true)]
    pool_size: Option<usize>,

    /// 调用超时（毫秒）
    #[arg(long, global = true, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 查询守护进程版本
    Hello,

    /// 已注册对象与 socket 槽位
    Status,

    /// 状态 + 统计计数与信号飞行时间直方图
    State,

    /// 开关统计
    Stats {
        #[arg(value_enum)]
        switch: Switch,
    },

    /// 开关逐条消息日志
    Logging {
        #[arg(value_enum)]
        switch: Switch,
    },

    /// 查询 (路径, 接口) 的注册 ID
    Index { object_path: String, interface: String },

    /// 读取属性
    Get {
        object_path: String,
        interface: String,
        property: String,
    },

    /// 写入属性（值的写法同 call 参数）
    Set {
        object_path: String,
        interface: String,
        property: String,
        value: String,
    },

    /// 方法调用，参数可带类型前缀（u32:7、s:text、f:0.5 ...）
    Call {
        object_path: String,
        interface: String,
        method: String,
        args: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Switch {
    On,
    Off,
}

impl Cli {
    fn bus_config(&self) -> BusConfig {
        let mut config =
            BusConfig::from_env().call_timeout(Some(Duration::from_millis(self.timeout_ms)));
        if let Some(base) = &self.socket_base {
            config.socket_base = base.clone();
        }
        if let Some(size) = self.pool_size {
            config.pool_size = size;
        }
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("saftbus_ctl=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.bus_config();
    let conn = ProxyConnection::connect(&config).context("failed to connect to saftbusd")?;
    debug!("connected as {} (slot {})", conn.session_id(), conn.slot());

    match cli.command {
        Commands::Hello => {
            println!("saftbusd {}", conn.ctl_hello()?);
        },

        Commands::Status => {
            print_status(&conn.ctl_status()?);
        },

        Commands::State => {
            print_state(&conn.ctl_state()?);
        },

        Commands::Stats { switch } => {
            let on = conn.set_statistics(switch == Switch::On)?;
            println!("statistics {}", if on { "enabled" } else { "disabled" });
        },

        Commands::Logging { switch } => {
            let on = conn.set_logging(switch == Switch::On)?;
            println!("logging {}", if on { "enabled" } else { "disabled" });
        },

        Commands::Index {
            object_path,
            interface,
        } => {
            println!("{}", conn.get_saftbus_index(&object_path, &interface)?);
        },

        Commands::Get {
            object_path,
            interface,
            property,
        } => {
            let value = conn.get_property(&object_path, &interface, &property)?;
            println!("{}", value_arg::render(&value));
        },

        Commands::Set {
            object_path,
            interface,
            property,
            value,
        } => {
            let value = value_arg::parse_value(&value)?;
            conn.set_property(&object_path, &interface, &property, value)?;
        },

        Commands::Call {
            object_path,
            interface,
            method,
            args,
        } => {
            let args = args
                .iter()
                .map(|arg| value_arg::parse_value(arg))
                .collect::<Result<Vec<_>, _>>()?;
            let reply = conn.call_sync(&object_path, &interface, &method, Value::Tuple(args), None)?;
            println!("{}", value_arg::render(&reply));
        },
    }
    Ok(())
}

fn print_status(status: &BusStatus) {
    println!("saftbusd {}", status.version);
    println!(
        "statistics: {}, logging: {}",
        on_off(status.stats_enabled),
        on_off(status.logging_enabled)
    );
    println!("subscriptions: {}", status.subscriptions);

    println!("objects ({}):", status.objects.len());
    for entry in &status.objects {
        println!("  {:>4}  {}  {}", entry.id, entry.object_path, entry.interface);
    }

    println!(
        "slots ({} of {} in use):",
        status.active_slots(),
        status.slots.len()
    );
    for slot in status.slots.iter().filter(|s| s.active) {
        println!(
            "  {:02}  {}  ({} proxy pipes)",
            slot.index,
            slot.session.as_deref().unwrap_or("<no handshake>"),
            slot.proxy_pipes
        );
    }
}

fn print_state(state: &BusState) {
    print_status(&state.status);
    println!("method calls: {}", state.method_calls);
    println!("signals emitted: {}", state.signals_emitted);
    if state.flight_time_histogram.is_empty() {
        println!("signal flight time: no samples");
        return;
    }
    println!("signal flight time (us):");
    for (upper, count) in &state.flight_time_histogram {
        println!("  < {:>10}  {}", upper, count);
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call_command() {
        let cli = Cli::parse_from([
            "saftbus-ctl",
            "--pool-size",
            "4",
            "call",
            "/x",
            "MyInterface",
            "Echo",
            "u32:7",
            "s:hi",
        ]);
        assert_eq!(cli.bus_config().pool_size, 4);
        match cli.command {
            Commands::Call { method, args, .. } => {
                assert_eq!(method, "Echo");
                assert_eq!(args, vec!["u32:7".to_string(), "s:hi".to_string()]);
            },
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_switch() {
        let cli = Cli::parse_from(["saftbus-ctl", "stats", "on"]);
        assert!(matches!(cli.command, Commands::Stats { switch: Switch::On }));
        let cli = Cli::parse_from(["saftbus-ctl", "logging", "off"]);
        assert!(matches!(cli.command, Commands::Logging { switch: Switch::Off }));
    }
}
