use console::{Emoji, style};

use crate::core::job::JobResult;

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

enum GuideLine {
    Command(String, String),
    Status(String, String),
    Text(String),
    Hint(String, String),
    Info(String),
    Blank,
}

/// A titled block of console lines, built up and printed in one go.
pub struct GuideSection {
    title: String,
    lines: Vec<GuideLine>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.lines
            .push(GuideLine::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(GuideLine::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Text(text.to_string()));
        self
    }

    pub fn hint(mut self, command: &str, description: &str) -> Self {
        self.lines
            .push(GuideLine::Hint(command.to_string(), description.to_string()));
        self
    }

    pub fn info(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Info(text.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(GuideLine::Blank);
        self
    }

    pub fn print(self) {
        println!("\n {}", style(&self.title).bold().underlined());
        for line in self.lines {
            match line {
                GuideLine::Command(name, description) => {
                    println!("   {:<12} {}", style(name).green().bold(), style(description).dim());
                }
                GuideLine::Status(label, value) => print_status(&label, &value),
                GuideLine::Text(text) => println!("   {}", text),
                GuideLine::Hint(command, description) => {
                    if description.is_empty() {
                        println!("   $ {}", style(command).cyan());
                    } else {
                        println!("   $ {}  {}", style(command).cyan(), style(description).dim());
                    }
                }
                GuideLine::Info(text) => println!("   {} {}", INFO_ICON, text),
                GuideLine::Blank => println!(),
            }
        }
    }
}

/// Prints one output section of a finished run, skipping empty ones.
fn print_section(title: &str, body: &str) {
    if body.trim().is_empty() {
        return;
    }
    println!("\n{}", style(format!("── {title} ──")).bold().cyan());
    println!("{}", body.trim_end());
}

pub fn print_job_result(result: &JobResult) {
    print_section("scheduler", &result.scheduler_output);
    print_section("sdvn", &result.sdvn_output);
    print_section("slab", &result.local_output);
    println!();
    print_status("Step", result.step.as_str());
    if result.succeeded() {
        print_success("Job completed");
    } else {
        print_error(&result.error_message);
    }
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "                 _       _            _   ",
        " _ __ ___  _   _| |_ ___| |_ ___  ___| |_ ",
        "| '__/ _ \\| | | | __/ _ \\ __/ _ \\/ __| __|",
        "| | | (_) | |_| | ||  __/ ||  __/\\__ \\ |_ ",
        "|_|  \\___/ \\__,_|\\__\\___|\\__\\___||___/\\__|",
    ];

    // Gradient: #34d399 → #22d3ee → #818cf8, left to right with a slight slant.
    let stops: [(u8, u8, u8); 3] = [(52, 211, 153), (34, 211, 238), (129, 140, 248)];
    let max_w = 42u32;
    let max_d = max_w + 4 * 8;

    println!();
    for (y, line) in lines.iter().enumerate() {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let d = ((x as u32 + y as u32 * 8) * 1000 / max_d).min(1000);
            let (r, g, b) = if d <= 500 {
                lerp_color(stops[0], stops[1], d * 2)
            } else {
                lerp_color(stops[1], stops[2], (d - 500) * 2)
            };
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");

    println!("\x1b[38;2;34;211;238mRoute diagnostics, on demand or on schedule.\x1b[0m\n");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let r = (a.0 as u32 * (1000 - t) + b.0 as u32 * t) / 1000;
    let g = (a.1 as u32 * (1000 - t) + b.1 as u32 * t) / 1000;
    let b_val = (a.2 as u32 * (1000 - t) + b.2 as u32 * t) / 1000;
    (r as u8, g as u8, b_val as u8)
}

pub fn print_goodbye() {
    println!("\n{} {}", SPARKLE, style("routetest stopped.").bold().cyan());
}
