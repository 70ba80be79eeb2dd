use chrono::Local;
use csv::Writer;
use libdhi::{Controller, ControllerConfig, EnergyWindow};
use std::{
    env,
    fs::File,
    io::{self, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

fn write_csv_record(wtr: &mut Writer<File>, sample: u64, singles: &[u64]) -> Result<(), csv::Error> {
    let mut record = vec![
        sample.to_string(),
        Local::now().format("%H:%M:%S%.3f").to_string(),
    ];
    record.extend(singles.iter().map(|s| s.to_string()));
    wtr.write_record(&record)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;

    let config = match env::args().nth(1) {
        Some(path) => ControllerConfig::load(Path::new(&path))?,
        None => ControllerConfig::default(),
    };
    let mut controller = Controller::new(config)?;
    controller.initialize_scan(EnergyWindow::new(400, 650)?, 3)?;

    // --- CSV Setup ---
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let csv_filename = format!("ring_singles_{}.csv", timestamp);
    let mut wtr = Writer::from_path(&csv_filename)?;
    println!("Writing singles to {}", csv_filename);

    let mut header = vec!["sample".to_string(), "time".to_string()];
    for head in controller.geometry().heads() {
        header.push(format!("h{}_singles", head.address));
    }
    wtr.write_record(&header)?;

    // --- Graceful Shutdown Setup ---
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    println!("Press Ctrl+C to stop recording.");

    let mut samples = 0u64;
    let interval = Duration::from_secs(1);
    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        match controller.ring_singles() {
            Ok(singles) => {
                samples += 1;
                write_csv_record(&mut wtr, samples, &singles)?;
                let total: u64 = singles.iter().sum();
                print!("\rSamples: {:>6} | Ring singles: {:>10}", samples, total);
                io::stdout().flush()?;
            }
            Err(e) => eprintln!("\n{}", e),
        }
        if let Some(notice) = controller.take_async() {
            println!("\nHead {:?}: {:?}", notice.head, notice.payload);
        }
        std::thread::sleep(interval.saturating_sub(started.elapsed()));
    }

    // --- Finalization ---
    wtr.flush()?;
    println!("\n\nFinished recording.");
    println!("Wrote {} samples to {}", samples, csv_filename);
    println!("Errors recorded: {}", controller.errors().total());
    Ok(())
}
