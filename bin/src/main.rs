use chrono::Local;
use clap::{ArgGroup, Parser};
use dimmer::{
    DimmerBuilder, DimmerConfig, DimmerError, EndpointInfo, IioLightSensor, Parameter,
    ParameterTarget, Selector,
};

/// Control the brightness and picture settings of every attached display
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(
            ArgGroup::new("action")
                .required(true)
                .args(["list", "get", "set", "inc", "dec", "schedule", "run"]),
        ))]
struct Args {
    /// Regular expression for the devices to match
    #[arg(long, value_name = "regex", default_value_t = String::from("."))]
    device: String,

    /// Only act on the display with this number, as shown by --list
    #[arg(long, value_name = "N")]
    display: Option<usize>,

    /// Parameter to act on, by name ("contrast", "red-gain") or VCP code ("0x12")
    #[arg(long, value_name = "name", default_value_t = Parameter::Brightness)]
    param: Parameter,

    /// List the displays and the parameters they support.
    #[arg(long)]
    list: bool,

    /// Print the current value of the parameter on each display.
    /// Brightness is a percentage of the maximum the display supports.
    #[arg(long)]
    get: bool,

    /// Sets the parameter to the specified value.
    #[arg(long, value_name = "value")]
    set: Option<u32>,

    /// Increases the parameter by the specified amount.
    #[arg(long, value_name = "value")]
    inc: Option<u32>,

    /// Decreases the parameter by the specified amount.
    #[arg(long, value_name = "value")]
    dec: Option<u32>,

    /// Print today's schedule from the config file.
    #[arg(long)]
    schedule: bool,

    /// Keep running, following the ambient light sensor and the schedule as configured.
    #[arg(long)]
    run: bool,
}

fn selected(endpoints: &[EndpointInfo], display: Option<usize>) -> Result<Vec<EndpointInfo>, DimmerError> {
    let selected: Vec<_> = endpoints
        .iter()
        .filter(|info| display.is_none_or(|ordinal| info.ordinal == ordinal))
        .cloned()
        .collect();
    if selected.is_empty() {
        return Err(DimmerError::NoDevices);
    }
    Ok(selected)
}

#[tokio::main]
async fn main() -> Result<(), DimmerError> {
    env_logger::init();
    let args = Args::parse();

    let mut config = DimmerConfig::load().await?;

    if args.schedule {
        let location = config.schedule.location()?;
        let today = Local::now().date_naive();
        let resolved = dimmer::resolve(&config.schedule.rules, today, location, &Local);
        for entry in resolved
            .entries
            .iter()
            .filter(|entry| entry.at.date_naive() == today)
        {
            println!(
                "{}  {:>3}%  {:?}",
                entry.at.format("%H:%M"),
                entry.value,
                entry.display
            );
        }
        return Ok(());
    }

    if !args.run {
        // One-shot commands must not race the background loops.
        config.auto.enabled = false;
        config.schedule.enabled = false;
    }

    let dimmer = DimmerBuilder::new()
        .with_device_regex(args.device.as_str())
        .with_config(config)
        .build()
        .await?;
    let endpoints = selected(&dimmer.live_endpoints().await, args.display)?;

    if args.list {
        for info in &endpoints {
            let parameters = match dimmer.capabilities(info.id).await {
                Ok(capabilities) => capabilities
                    .iter()
                    .map(|(parameter, capability)| {
                        format!("{parameter}={}/{}", capability.current, capability.max)
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
                Err(e) => e.to_string(),
            };
            println!("{}: {} ({:?}) {parameters}", info.ordinal, info.name, info.kind);
        }
    } else if args.get {
        for info in &endpoints {
            match dimmer.get(info.id, args.param).await {
                Ok(value) => println!("{}: {value}", info.name),
                Err(e) => eprintln!("{}: {e}", info.name),
            }
        }
    } else if let Some(value) = args.set {
        for info in &endpoints {
            let target = ParameterTarget::new(Selector::Endpoint(info.id), args.param, value);
            dimmer.manual_apply(target).await?;
        }
    } else if args.inc.is_some() || args.dec.is_some() {
        for info in &endpoints {
            let current = dimmer.get(info.id, args.param).await?;
            let value = match (args.inc, args.dec) {
                (Some(inc), _) => current.saturating_add(inc),
                (_, Some(dec)) => current.saturating_sub(dec),
                _ => current,
            };
            let target = ParameterTarget::new(Selector::Endpoint(info.id), args.param, value);
            dimmer.manual_apply(target).await?;
        }
    } else if args.run {
        match IioLightSensor::discover().await {
            Ok(Some(sensor)) => dimmer.attach_sensor(sensor),
            Ok(None) => log::info!("no ambient light sensor found"),
            Err(e) => log::warn!("looking for an ambient light sensor: {e}"),
        }
        dimmer.apply_schedule_now().await;
        tokio::signal::ctrl_c().await?;
    }

    dimmer.shutdown().await;
    Ok(())
}
