// SPDX-License-Identifier: GPL-3.0-only

extern crate system76_firmware_varstore as varstore;

use std::sync::Arc;
use std::{char, env, fs, process};

use log::{LevelFilter, Log, Metadata, Record};
use varstore::guid::GuidFmt;
use varstore::{BootPhase, VariableConfig, VariableStoreEngine};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{}: {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() {
    let path = match env::args().nth(1) {
        Some(some) => some,
        None => {
            eprintln!("system76_firmware_varstore [file]");
            process::exit(1);
        }
    };

    let level = if env::var_os("VARSTORE_DEBUG").is_some() {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    if let Err(err) = log::set_logger(&LOGGER).map(|()| log::set_max_level(level)) {
        eprintln!("failed to set logger: {}", err);
        process::exit(1);
    }

    let data = match fs::read(&path) {
        Ok(ok) => ok,
        Err(err) => {
            eprintln!("failed to read {}: {}", path, err);
            process::exit(1);
        }
    };

    let mut engine = match VariableStoreEngine::new(
        VariableConfig::default(),
        data,
        None,
        None,
        Arc::new(BootPhase::new()),
    ) {
        Ok(ok) => ok,
        Err(err) => {
            println!("\x1B[1m\x1B[91mVariable store is corrupted: {}\x1B[39m\x1B[0m", err);
            process::exit(1);
        }
    };

    let list = match engine.list_variables() {
        Ok(ok) => ok,
        Err(err) => {
            eprintln!("failed to list variables: {}", err);
            process::exit(1);
        }
    };

    for (name, guid) in list.iter() {
        let (attributes, value) = match engine.read_variable(name, guid) {
            Ok(ok) => ok,
            Err(err) => {
                eprintln!("failed to read variable: {}", err);
                continue;
            }
        };

        print!("\x1B[1m{}:", GuidFmt(guid));
        for c in char::decode_utf16(name.iter().copied()) {
            print!("{}", c.unwrap_or(char::REPLACEMENT_CHARACTER));
        }
        println!(" ({:#04X}): {}\x1B[0m", attributes.bits(), value.len());

        for row in 0..(value.len() + 15) / 16 {
            print!("{:04X}:", row * 16);
            for col in 0..16 {
                let j = row * 16 + col;
                if j < value.len() {
                    print!(" {:02X}", value[j]);
                }
            }
            println!();
        }
    }

    println!();

    let (used, size) = engine.nv_used();
    let percent = (used * 100) / size.max(1);
    println!("\x1B[1mVariable store used space:\x1B[0m {} / {} bytes ({}%)", used, size, percent);

    if engine.free_area_dirty() {
        println!(
            "\x1B[1m\x1B[91mVariable store is corrupted after offset {:#x}\x1B[39m\x1B[0m",
            used
        );
    }
}
