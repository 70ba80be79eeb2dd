use libdhi::{Controller, ControllerConfig, LinkConfig, ScannerModel, SimulationConfig};
use std::{env, path::Path};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init()?;

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <config.toml | serial_port | host:port | sim> [baud_rate]", args[0]);
        eprintln!("Example: {} /dev/ttyUSB0 38400", args[0]);
        return Ok(());
    }

    let target = &args[1];
    let config = if target.ends_with(".toml") {
        ControllerConfig::load(Path::new(target))?
    } else {
        let link = if target == "sim" {
            LinkConfig::Simulation(SimulationConfig::default())
        } else if target.contains(':') {
            LinkConfig::Network {
                address: target.clone(),
            }
        } else {
            let baud = args.get(2).and_then(|b| b.parse::<u32>().ok()).unwrap_or(38400);
            LinkConfig::Serial {
                port: target.clone(),
                baud,
            }
        };
        ControllerConfig {
            scanner: ScannerModel::Hrrt,
            link,
            ..ControllerConfig::default()
        }
    };

    let mut controller = Controller::new(config)?;
    let report = controller.health_check()?;
    for head in &report {
        match &head.firmware {
            Some(firmware) => println!("Head {:>2}: {}", head.head, firmware),
            None => println!("Head {:>2}: no answer", head.head),
        }
    }
    let alive = report.iter().filter(|h| h.alive()).count();
    println!("{}/{} heads alive.", alive, report.len());

    for entry in controller.errors().entries() {
        println!("{} {:>5} {}", entry.time.format("%H:%M:%S"), entry.code, entry.message);
    }
    Ok(())
}
