use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use pcjit::{
    compile, decode_image, disassemble, Cell, Environment, ErrorCode, JitConfig, PluginContext,
    PluginRuntime,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    image: Option<String>,
    entry: String,
    args: Vec<Cell>,
    dump: bool,
    eager: bool,
    help: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            image: None,
            entry: "main".to_string(),
            args: Vec::new(),
            dump: false,
            eager: false,
            help: false,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }

    let Some(image_path) = &cli.image else {
        print_usage();
        return Err(io::Error::other("missing image path").into());
    };

    let bytes = std::fs::read(PathBuf::from(image_path))?;
    let image = decode_image(&bytes)?;
    let name = PathBuf::from(image_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plugin".to_string());

    if cli.dump {
        println!("{}", disassemble(image.code()));
    }

    let env = Environment::new(JitConfig::default())?;
    let runtime = PluginRuntime::with_name(env.clone(), image, &name)?;
    bind_default_natives(&runtime);

    if cli.eager {
        compile_all_publics(&env, &runtime)?;
    }

    let Some(public) = runtime.image().find_public(&cli.entry).cloned() else {
        return Err(io::Error::other(format!("no public named '{}'", cli.entry)).into());
    };
    let method = runtime
        .acquire_method(public.pcode_offset)
        .ok_or_else(|| io::Error::other(format!("'{}' is not a function start", cli.entry)))?;
    let fun = compile(&env, &runtime, &method)?;

    if cli.dump {
        println!(
            "{}: {} bytes native, {} cip entries, {} loop edges",
            public.name,
            fun.chunk().len(),
            fun.cip_map().len(),
            fun.loop_edges().len()
        );
    }

    let mut ctx = PluginContext::new(env.clone(), runtime.clone());
    match env.invoke(&mut ctx, &fun, &cli.args) {
        Ok(result) => {
            println!("{} returned {result}", public.name);
            println!("compiled functions: {}", env.compile_count());
            Ok(())
        }
        Err(err) => {
            let detail = ctx
                .last_error()
                .and_then(|reported| reported.cip)
                .map(|cip| format!(" at cip {cip:#x}"))
                .unwrap_or_default();
            Err(io::Error::other(format!("script error: {err}{detail}")).into())
        }
    }
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| io::Error::other(err.to_string()))?;
    Ok(())
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;

    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--dump" => {
                cfg.dump = true;
                index += 1;
            }
            "--eager" => {
                cfg.eager = true;
                index += 1;
            }
            "--entry" => {
                let name = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --entry".to_string())?;
                cfg.entry = name.clone();
                index += 2;
            }
            "--arg" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --arg".to_string())?;
                let value = raw
                    .parse::<Cell>()
                    .map_err(|_| format!("invalid --arg value '{raw}'"))?;
                cfg.args.push(value);
                index += 2;
            }
            value if value.starts_with('-') => {
                return Err(format!("unknown flag '{value}'"));
            }
            path => {
                if cfg.image.is_some() {
                    return Err("multiple image paths provided".to_string());
                }
                cfg.image = Some(path.to_string());
                index += 1;
            }
        }
    }

    Ok(cfg)
}

fn bind_default_natives(runtime: &Arc<PluginRuntime>) {
    // Host bindings for the stock diagnostics natives; plugins referencing
    // anything else run with those natives unbound.
    for name in runtime.image().natives().to_vec() {
        let bound = match name.as_str() {
            "print_cell" => runtime.bind_native(
                "print_cell",
                Box::new(|args: &[Cell]| -> Result<Cell, ErrorCode> {
                    if let Some(value) = args.first() {
                        println!("{value}");
                    }
                    Ok(args.first().copied().unwrap_or(0))
                }),
            ),
            _ => continue,
        };
        if let Err(err) = bound {
            tracing::warn!(native = %name, %err, "failed to bind native");
        }
    }
}

fn compile_all_publics(
    env: &Arc<Environment>,
    runtime: &Arc<PluginRuntime>,
) -> Result<(), ErrorCode> {
    for public in runtime.image().publics().to_vec() {
        let Some(method) = runtime.acquire_method(public.pcode_offset) else {
            tracing::warn!(public = %public.name, "public does not start a function");
            continue;
        };
        compile(env, runtime, &method)?;
        tracing::info!(public = %public.name, "compiled");
    }
    Ok(())
}

fn print_usage() {
    println!("Usage:");
    println!("  pcjit <image> [--entry NAME] [--arg N]... [--dump] [--eager]");
    println!();
    println!("  --entry NAME   public function to invoke (default: main)");
    println!("  --arg N        push a cell argument (repeatable)");
    println!("  --dump         print the p-code disassembly and compile stats");
    println!("  --eager        compile every public before invoking");
}

#[cfg(test)]
mod tests {
    use super::parse_cli_args;

    fn s(value: &str) -> String {
        value.to_string()
    }

    #[test]
    fn parse_cli_defaults() {
        let cfg = parse_cli_args(&[]).expect("parse should succeed");
        assert!(cfg.image.is_none());
        assert_eq!(cfg.entry, "main");
        assert!(cfg.args.is_empty());
        assert!(!cfg.dump);
        assert!(!cfg.eager);
    }

    #[test]
    fn parse_cli_collects_args_in_order() {
        let cfg = parse_cli_args(&[
            s("plugin.pjt"),
            s("--arg"),
            s("3"),
            s("--arg"),
            s("-7"),
            s("--entry"),
            s("on_request"),
        ])
        .expect("parse should succeed");
        assert_eq!(cfg.image.as_deref(), Some("plugin.pjt"));
        assert_eq!(cfg.args, vec![3, -7]);
        assert_eq!(cfg.entry, "on_request");
    }

    #[test]
    fn parse_cli_rejects_unknown_flags_and_extra_paths() {
        assert!(parse_cli_args(&[s("--bogus")]).is_err());
        assert!(parse_cli_args(&[s("a.pjt"), s("b.pjt")]).is_err());
        assert!(parse_cli_args(&[s("--arg"), s("x")]).is_err());
    }
}
