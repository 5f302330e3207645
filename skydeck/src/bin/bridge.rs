//! Skydeck bridge daemon.
//!
//! Subscribes to a set of data references, renders them as text to stderr
//! and forwards simulator commands. Useful for checking a simulator link
//! without a control surface attached.
//!
//! # Usage
//!
//! ```sh
//! skydeck-bridge --sim 127.0.0.1:49000 \
//!     --dataref sim/cockpit2/gauges/indicators/airspeed_kts_pilot \
//!     --dataref sim/cockpit2/gauges/indicators/altitude_ft_pilot --hz 4
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: unsubscribe everything and exit

use std::io;
use std::time::Duration;

use skydeck::bridge::{Instrument, Page};
use skydeck::render::{RenderError, Renderer, SurfaceId};
use skydeck::{
    Bridge, BridgeConfig, BridgeError, Clock, Endpoint, Frequency, LinkConfig, Readings,
    SystemClock, TelemetryLink, format_value,
};
use thiserror::Error;

/// Default instrument refresh rate.
const DEFAULT_HZ: u16 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("cannot resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Link(#[from] skydeck::LinkError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("cannot install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

struct Options {
    link: LinkConfig,
    data_refs: Vec<String>,
    frequency: Frequency,
    commands: Vec<String>,
}

/// One line of text per draw.
struct TextFrame {
    line: String,
}

/// Prints every frame to stderr.
struct LogRenderer;

impl Renderer for LogRenderer {
    type Context = TextFrame;

    fn draw(
        &mut self,
        surface: SurfaceId,
        paint: &mut dyn FnMut(&mut TextFrame),
    ) -> Result<(), RenderError> {
        let mut frame = TextFrame { line: String::new() };
        paint(&mut frame);
        eprintln!("{surface}: {}", frame.line);
        Ok(())
    }
}

fn main() {
    skydeck::trace::init_tracing();
    if let Err(e) = run() {
        eprintln!("skydeck-bridge: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let clock = SystemClock::new();
    let link = TelemetryLink::bind(&options.link, clock.now())?;
    eprintln!(
        "skydeck-bridge: {} data ref(s) from {}",
        options.data_refs.len(),
        link.simulator()
    );

    let bridge = Bridge::new(
        link,
        LogRenderer,
        vec![page(&options.data_refs)],
        clock,
        BridgeConfig::default().with_default_frequency(options.frequency),
    )?;
    let running = bridge.spawn()?;
    let handle = running.handle();

    for command in options.commands {
        handle.send_command(command)?;
    }

    let signal = running.handle();
    ctrlc::set_handler(move || {
        let _ = signal.shutdown();
    })?;

    running.join()?;
    eprintln!("skydeck-bridge: stopped");
    Ok(())
}

fn page(data_refs: &[String]) -> Page<TextFrame> {
    data_refs
        .iter()
        .enumerate()
        .fold(Page::new("cli"), |page, (i, data_ref)| {
            let name = data_ref.clone();
            let surface = SurfaceId::new(u16::try_from(i).unwrap_or(u16::MAX));
            page.with_instrument(Instrument::gauge(
                surface,
                data_ref.as_str(),
                move |readings: &Readings, frame: &mut TextFrame| {
                    frame.line = format!("{name} = {}", format_value(readings.primary(), 2));
                },
            ))
        })
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, CliError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
}

fn number<N: std::str::FromStr>(raw: &str, flag: &str) -> Result<N, CliError> {
    raw.parse()
        .map_err(|_| CliError::Usage(format!("invalid value for {flag}: {raw}")))
}

fn resolve(addr: &str) -> Result<Endpoint, CliError> {
    Endpoint::resolve(addr).map_err(|source| CliError::Resolve {
        addr: addr.to_owned(),
        source,
    })
}

fn parse_args(args: &[String]) -> Result<Options, CliError> {
    let mut link = LinkConfig::default();
    let mut data_refs = Vec::new();
    let mut commands = Vec::new();
    let mut hz = DEFAULT_HZ;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--sim" | "-s" => {
                i += 1;
                link = link.with_simulator(resolve(value(args, i, flag)?)?);
            }
            "--bind" | "-b" => {
                i += 1;
                link = link.with_bind_addr(resolve(value(args, i, flag)?)?);
            }
            "--dataref" | "-d" => {
                i += 1;
                data_refs.push(value(args, i, flag)?.to_owned());
            }
            "--hz" => {
                i += 1;
                hz = number(value(args, i, flag)?, flag)?;
                if hz == 0 {
                    return Err(CliError::Usage("--hz must be at least 1".into()));
                }
            }
            "--command" | "-c" => {
                i += 1;
                commands.push(value(args, i, flag)?.to_owned());
            }
            "--interval-ms" => {
                i += 1;
                let ms = number(value(args, i, flag)?, flag)?;
                link = link.with_check_interval(Duration::from_millis(ms));
            }
            "--timeout-ms" => {
                i += 1;
                let ms = number(value(args, i, flag)?, flag)?;
                link = link.with_status_timeout(Duration::from_millis(ms));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(CliError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    if data_refs.is_empty() && commands.is_empty() {
        return Err(CliError::Usage(
            "nothing to do: pass --dataref or --command".into(),
        ));
    }

    Ok(Options {
        link,
        data_refs,
        frequency: Frequency::new(hz),
        commands,
    })
}

fn print_usage() {
    eprintln!(
        r#"skydeck-bridge - simulator telemetry bridge

USAGE:
    skydeck-bridge [OPTIONS]

OPTIONS:
    -s, --sim <ADDR>          Simulator address (default: 127.0.0.1:49000)
    -b, --bind <ADDR>         Local bind address (default: 0.0.0.0:0)
    -d, --dataref <NAME>      Subscribe and display a data ref (can be repeated)
        --hz <N>              Refresh rate for every data ref (default: 2)
    -c, --command <NAME>      Send a command once at startup (can be repeated)
        --interval-ms <MS>    Liveness check interval (default: 5000)
        --timeout-ms <MS>     Silence before resubscribing (default: 1000)
    -h, --help                Print this help message

SIGNALS:
    SIGTERM, SIGINT           Unsubscribe and exit

EXAMPLE:
    skydeck-bridge --dataref sim/flightmodel/position/indicated_airspeed --hz 4
    skydeck-bridge --command sim/lights/landing_lights_toggle
"#
    );
}
