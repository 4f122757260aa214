//! Script assembler and runner CLI.
//!
//! Assembles a text module into a bytecode image, and optionally runs one of
//! its functions on a standalone host.
//!
//! # Usage
//! ```text
//! svmasm <input.sasm | input.svmb> [OPTIONS]
//! ```
//!
//! # Options
//! - `-o, --output <file>`: Write the bytecode image (defaults to `<input>.svmb`)
//! - `--run <function> [args...]`: Call a function after loading the module
//! - `-r, --results <banks>`: Result slots to request, as bank prefixes (`d,f,s,a`)
//!
//! Arguments after `--run <function>` are parsed as int, then float, and
//! are passed as strings otherwise.

use scriptvm::utils::log::init_from_env;
use scriptvm::virtual_machine::assembler::assemble_file;
use scriptvm::virtual_machine::errors::ScriptAbort;
use scriptvm::virtual_machine::function::ReturnSlot;
use scriptvm::virtual_machine::host::{Host, StandaloneHost};
use scriptvm::virtual_machine::operand::{RegBank, RegType};
use scriptvm::virtual_machine::program::Module;
use scriptvm::virtual_machine::value::Value;
use scriptvm::virtual_machine::vm::{Vm, VmConfig};
use scriptvm::{error, info};
use std::env;
use std::fs;
use std::path::Path;
use std::process;

const IMAGE_EXTENSION: &str = "svmb";

struct Options {
    input: String,
    output: Option<String>,
    run: Option<(String, Vec<Value>)>,
    results: Vec<RegType>,
}

fn main() {
    init_from_env();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let options = parse_options(&args).unwrap_or_else(|message| {
        error!("{message}\n");
        print_usage(&args[0]);
        process::exit(1);
    });

    if !Path::new(&options.input).exists() {
        error!("Input file does not exist: {}", options.input);
        process::exit(1);
    }

    let is_image = Path::new(&options.input)
        .extension()
        .is_some_and(|ext| ext == IMAGE_EXTENSION);
    let module = if is_image {
        load_image(&options.input)
    } else {
        assemble(&options)
    };

    if let Some((name, call_args)) = &options.run {
        if let Err(abort) = run(&module, name, call_args, &options.results) {
            error!("{abort}");
            process::exit(2);
        }
    }
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        input: args[1].clone(),
        output: None,
        run: None,
        results: Vec::new(),
    };

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                i += 1;
                let path = args.get(i).ok_or(format!("{k} requires an argument"))?;
                options.output = Some(path.clone());
                i += 1;
            }
            k @ ("--results" | "-r") => {
                i += 1;
                let banks = args.get(i).ok_or(format!("{k} requires an argument"))?;
                options.results = parse_result_types(banks)?;
                i += 1;
            }
            "--run" => {
                i += 1;
                let name = args.get(i).ok_or("--run requires a function name")?;
                let call_args = args[i + 1..].iter().map(|a| parse_argument(a)).collect();
                options.run = Some((name.clone(), call_args));
                break;
            }
            other => return Err(format!("Unexpected argument: {other}")),
        }
    }
    Ok(options)
}

fn parse_result_types(spec: &str) -> Result<Vec<RegType>, String> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let mut chars = s.chars();
            match (chars.next().and_then(RegBank::from_prefix), chars.next()) {
                (Some(bank), None) => Ok(RegType::new(bank, 0)),
                _ => Err(format!("Invalid result bank: '{s}' (expected d, f, s or a)")),
            }
        })
        .collect()
}

fn parse_argument(arg: &str) -> Value {
    if let Ok(v) = arg.parse::<i32>() {
        return Value::Int(v);
    }
    if let Ok(v) = arg.parse::<f64>() {
        return Value::Float(v);
    }
    Value::String(arg.to_string())
}

fn assemble(options: &Options) -> Module {
    let module = assemble_file(&options.input).unwrap_or_else(|e| {
        error!("Assembly failed: {e}");
        process::exit(1);
    });

    let output_path = options.output.clone().unwrap_or_else(|| {
        Path::new(&options.input)
            .with_extension(IMAGE_EXTENSION)
            .to_string_lossy()
            .into_owned()
    });

    if let Some(parent) = Path::new(&output_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        error!("Output directory does not exist: {}", parent.display());
        process::exit(1);
    }

    let image = module.to_bytes();
    if let Err(e) = fs::write(&output_path, &image) {
        error!("Failed to write output file: {e}");
        process::exit(1);
    }
    info!(
        "Assembled {} -> {} ({} functions, {} bytes)",
        options.input,
        output_path,
        module.functions.len(),
        image.len()
    );
    module
}

fn load_image(path: &str) -> Module {
    let bytes = fs::read(path).unwrap_or_else(|e| {
        error!("Failed to read {path}: {e}");
        process::exit(1);
    });
    Module::from_bytes(&bytes).unwrap_or_else(|e| {
        error!("Invalid bytecode image {path}: {e}");
        process::exit(1);
    })
}

fn native_print(
    _vm: &mut Vm,
    _host: &mut dyn Host,
    args: &[Value],
    _results: &mut [ReturnSlot],
) -> Result<usize, ScriptAbort> {
    let line: Vec<String> = args.iter().map(ToString::to_string).collect();
    println!("{}", line.join(" "));
    Ok(0)
}

fn run(module: &Module, name: &str, args: &[Value], results: &[RegType]) -> Result<(), ScriptAbort> {
    let mut host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig::from_env());
    vm.functions_mut().register_native("print", native_print);
    vm.load_module(&host, module)?;

    let mut slots: Vec<ReturnSlot> = results.iter().copied().map(ReturnSlot::new).collect();
    let returned = vm.call_by_name(&mut host, name, args, &mut slots)?;
    info!("{name} returned {returned} value(s)");
    for (i, slot) in slots.iter().enumerate() {
        match &slot.value {
            Some(value) => println!("[{i}] {value}"),
            None => println!("[{i}] <unset>"),
        }
    }
    Ok(())
}

const USAGE: &str = "\
Script Assembler

USAGE:
    {program} <input> [OPTIONS]

ARGS:
    <input>    Assembly source, or a .svmb image to run directly

OPTIONS:
    -o, --output <file>        Bytecode image path (defaults to <input>.svmb)
    -r, --results <banks>      Result slots to request, e.g. d,f
    --run <function> [args]    Call a function after loading; must come last
    -h, --help                 Print this help message

ENVIRONMENT:
    SCRIPTVM_LOG               Minimum log level (debug, info, warn, error)
    SCRIPTVM_MAX_CALL_DEPTH    Nested call limit
    SCRIPTVM_FLOAT_EPSILON     Tolerance of approximate comparisons

EXAMPLES:
    {program} player.sasm
    {program} player.sasm -o build/player.svmb
    {program} player.sasm -r d --run Add 3 4
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
