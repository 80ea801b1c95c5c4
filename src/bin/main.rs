use serde_json::Value;
use std::{env, error::Error, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use modvisor::{
    cli::{Cli, Commands, ServiceCommand, parse_args},
    config::load_settings,
    context::Context,
    module::{self, Module},
    process::{self, ExitReason},
    service::Service,
    watch::when_modified,
};

/// Exit status reported when `start --timeout` had to kill the script.
const TIMEOUT_EXIT_CODE: i32 = 124;

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match execute(args) {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{err}");
            Err(err)
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(directive) = args.log_directive() {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Stdout belongs to the scripts being run.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn execute(args: Cli) -> Result<i32, Box<dyn Error>> {
    register_signal_handler()?;

    let settings = load_settings(args.config.as_deref())?;
    let context = Context::from_settings(settings);

    match args.command {
        Commands::Run {
            target,
            hide,
            format,
        } => {
            let module = Module::open_with(&target.module, context)?;
            let process = module.run(&target.argv(), hide)?;
            if let Some(format) = format {
                println!("{}", process.output(format)?);
            }
            Ok(process.exit_code().unwrap_or(1))
        }
        Commands::Start {
            target,
            hide,
            timeout,
        } => {
            let module = Module::open_with(&target.module, context)?;
            let timeout = timeout.map(Duration::from_secs);
            let process = module.start_with(&target.argv(), hide, timeout)?;
            info!("Started `{}` with PID {}", target.script, process.pid());

            process.wait();
            info!("`{}` ended after {:?}", target.script, process.elapsed());
            match process.exit_reason() {
                Some(ExitReason::TimedOut) => {
                    warn!("`{}` timed out", target.script);
                    Ok(TIMEOUT_EXIT_CODE)
                }
                _ => Ok(process.exit_code().unwrap_or(1)),
            }
        }
        Commands::Cap { target } => {
            let module = Module::open_with(&target.module, context)?;
            let value: Value = module.cap(&target.argv())?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(0)
        }
        Commands::Resolve { module, name } => {
            let module = Module::open_with(&module, context)?;
            println!("{}", module.resolve_file(&name)?.display());
            Ok(0)
        }
        Commands::Install { module, hide } => {
            let module = Module::open_with(&module, context)?;
            module.install(hide)?;
            info!("Module '{}' installed", module.name());
            Ok(0)
        }
        Commands::Watch { modules, count } => {
            let modules = modules
                .iter()
                .map(|path| Module::open_with(path, context.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            let refs: Vec<&Module> = modules.iter().collect();
            let watcher = when_modified(&refs);

            if watcher.files().is_empty() {
                warn!("No watch files declared; nothing to do");
                return Ok(0);
            }
            info!("Watching {} file(s)", watcher.files().len());

            for (seen, file) in watcher.enumerate() {
                println!("{}", file.path().display());
                if count.is_some_and(|limit| seen + 1 >= limit) {
                    break;
                }
            }
            Ok(0)
        }
        Commands::Scan { root } => {
            let root = match root.or_else(|| context.settings.module_root.clone()) {
                Some(root) => root,
                None => env::current_dir()?,
            };
            for found in module::scan(&root, &context)? {
                match found {
                    Ok(module) => {
                        let state = if module.enabled() { "enabled" } else { "disabled" };
                        println!("{}\t{state}\t{}", module.name(), module.root().display());
                    }
                    Err(err) => warn!("{err}"),
                }
            }
            Ok(0)
        }
        Commands::Service { action } => run_service(action, context),
    }
}

fn run_service(action: ServiceCommand, context: Context) -> Result<i32, Box<dyn Error>> {
    let target = action.target();
    let module = Module::open_with(&target.module, context)?;
    let service = Service::new(&module, &target.dir, target.args.iter().cloned());

    match action {
        ServiceCommand::Start { if_stopped, .. } => {
            if !service.start(!if_stopped)? {
                info!("Service {service} is already running");
            }
        }
        ServiceCommand::Stop { .. } => service.stop()?,
        ServiceCommand::Running { .. } => println!("{}", service.running()?),
        ServiceCommand::Disable { stop, .. } => service.disable(stop)?,
        ServiceCommand::Enable { .. } => {
            service.lock().delete()?;
            info!("Enabled service {service}");
        }
        ServiceCommand::Status { .. } => println!("{}", service.state()),
    }
    Ok(0)
}

fn register_signal_handler() -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        eprintln!("modv is shutting down... killing child process groups");
        process::kill_all();
        std::process::exit(130);
    })?;

    Ok(())
}
