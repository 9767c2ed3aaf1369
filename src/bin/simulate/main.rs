//! Two simulated stations and a locator, talking over an in-process broker.
//! Prints every location the locator reports until enough rounds are done
//! or Ctrl-C is pressed.

use acousticlocator::{
    args::SimulateArgs,
    audio::SyntheticSource,
    config::{GridConfig, LocatorConfig, StationConfig},
    controller::{run_locator, StationController},
    error::LocatorError,
    message::LocationReport,
    position,
    transport::{LocalBroker, MessageHandler, Transport},
    Position,
};

use clap::Parser;
use log::{error, info, warn};
use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

const ESTIMATE_TOPIC: &str = "simulation/pointing";
const RESULT_TOPIC: &str = "simulation/location";

// Example:
// cargo run --bin simulate -- --source 0.2 -0.4 1.5 --noise 0.05 --rounds 5

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = SimulateArgs::parse();

    match simulate(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn station_config(id: &str, x: f64, args: &SimulateArgs) -> StationConfig {
    let mut config = StationConfig::at([x, 0.0, 0.0]);
    config.id = id.to_owned();
    config.freq = args.freq;
    config.n_bands = 0;
    config.interval = args.interval;
    config.triangulate = false;
    config.grid = GridConfig {
        increment: args.increment,
        ..GridConfig::default()
    };
    config.broker.topic = ESTIMATE_TOPIC.to_owned();
    config
}

fn spawn_station(
    broker: &LocalBroker,
    config: StationConfig,
    source: Position,
    noise: f64,
) -> Result<(Arc<AtomicBool>, JoinHandle<Result<(), LocatorError>>), LocatorError> {
    let geometry = config.geometry()?;
    let mut audio = SyntheticSource::new(
        &config.id,
        &config.mic_world_positions(&geometry),
        source,
        config.freq,
        config.sample_rate,
        config.block_size,
    )?
    .noise(noise, None)
    .realtime(true);

    let transport = Arc::new(broker.client(&config.id));
    let mut controller = StationController::new(config, transport)?;
    let stop = controller.stop_flag();
    Ok((stop, thread::spawn(move || controller.run(&mut audio))))
}

fn simulate(args: &SimulateArgs) -> Result<(), LocatorError> {
    let source = Position::new(args.source[0], args.source[1], args.source[2]);
    let broker = LocalBroker::new();

    let (results_tx, results) = mpsc::channel();
    let results_tx = Mutex::new(results_tx);
    let on_result: MessageHandler = Arc::new(move |_topic: &str, raw: &[u8]| {
        if let Ok(tx) = results_tx.lock() {
            let _ = tx.send(raw.to_vec());
        }
    });
    broker.client("simulate").subscribe(RESULT_TOPIC, on_result)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let on_interrupt = Arc::clone(&interrupted);
    ctrlc::set_handler(move || on_interrupt.store(true, Ordering::SeqCst))
        .map_err(|e| LocatorError::Config(format!("cannot install interrupt handler: {}", e)))?;

    let mut locator_config = LocatorConfig {
        id: "locator".to_owned(),
        ..LocatorConfig::default()
    };
    locator_config.broker.topic = ESTIMATE_TOPIC.to_owned();
    locator_config.broker.result_topic = Some(RESULT_TOPIC.to_owned());
    let locator_stop = Arc::new(AtomicBool::new(false));
    let locator = {
        let transport: Arc<dyn Transport> = Arc::new(broker.client(&locator_config.id));
        let stop = Arc::clone(&locator_stop);
        thread::spawn(move || run_locator(&locator_config, transport, stop))
    };
    // Let the locator subscribe before the first estimate goes out
    thread::sleep(Duration::from_millis(100));

    let half = args.baseline / 2.0;
    let stations = [
        spawn_station(&broker, station_config("station-a", -half, args), source, args.noise)?,
        spawn_station(&broker, station_config("station-b", half, args), source, args.noise)?,
    ];
    info!(
        "simulating a {} Hz source at ({}, {}, {})",
        args.freq, source.x, source.y, source.z
    );

    let mut rounds = 0;
    while rounds < args.rounds && !interrupted.load(Ordering::SeqCst) {
        if stations.iter().any(|(_, handle)| handle.is_finished()) {
            warn!("a station stopped early");
            break;
        }
        let Ok(raw) = results.recv_timeout(Duration::from_millis(100)) else {
            continue;
        };
        let report: LocationReport = serde_json::from_slice(&raw)?;
        let error = (position(report.location) - source).norm();
        rounds += 1;
        println!(
            "round {}: ({:.3}, {:.3}, {:.3}), residual {:.4}, {:.3} m from the source",
            rounds,
            report.location[0],
            report.location[1],
            report.location[2],
            report.residual,
            error
        );
    }

    let mut outcome = Ok(());
    for (stop, handle) in stations {
        stop.store(true, Ordering::SeqCst);
        let result = handle
            .join()
            .map_err(|_| LocatorError::Config("station thread panicked".to_owned()))
            .and_then(|r| r);
        outcome = outcome.and(result);
    }
    locator_stop.store(true, Ordering::SeqCst);
    let located = locator
        .join()
        .map_err(|_| LocatorError::Config("locator thread panicked".to_owned()))
        .and_then(|r| r);
    outcome.and(located.map(|n| info!("{} location(s) reported", n)))
}
