mod session;
mod sim;

use std::env;
use std::io::{self, BufRead, Write};
use std::process;

use crossterm::style::Stylize;
use probe_core::config::ProbeConfig;
use probe_core::pins::Polarity;

use session::{Line, Session};

fn main() -> io::Result<()> {
    let config = parse_config().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!(
            "Usage: probe-emulator [--active-low-leds] [--debounce <ticks>] [--no-update-mode]"
        );
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(config);
    let mut line = String::new();

    writeln!(
        writer,
        "{}",
        "DAP42 probe emulator ready. Type `help` for commands or `exit` to quit.".bold()
    )?;
    print_lines(&mut writer, &session.take_trace())?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        match session.handle_command(trimmed) {
            Ok(lines) => print_lines(&mut writer, &lines)?,
            Err(err) => writeln!(writer, "{}", err.to_string().red())?,
        }
    }

    Ok(())
}

fn print_lines(writer: &mut impl Write, lines: &[Line]) -> io::Result<()> {
    for line in lines {
        match line {
            Line::Info(text) => writeln!(writer, "{text}")?,
            Line::Trace(text) => writeln!(writer, "  {}", text.as_str().dark_grey())?,
        }
    }
    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_config() -> Result<ProbeConfig, String> {
    let mut config = ProbeConfig::DEFAULT;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--active-low-leds" => config = config.with_led_polarity(Polarity::ActiveLow),
            "--no-update-mode" => config = config.with_update_mode(false),
            "--debounce" => {
                let value = args
                    .next()
                    .ok_or_else(|| "Expected value after --debounce".to_string())?;
                let ticks = value
                    .parse()
                    .map_err(|_| format!("Invalid debounce `{value}`"))?;
                config = config.with_target_debounce(ticks);
            }
            other => return Err(format!("Unknown argument `{other}`")),
        }
    }
    Ok(config)
}
