//! Info / text reporting modes (spec §1's "out of scope" front end surfaces,
//! kept as a small adapter the CLI calls before the engine is ever built —
//! ported from `pymod`'s `info`/`text` branches).

use crate::config::PlayMode;
use crate::song::Module;

/// Prints the module report for `play_mode`. A no-op for any audio-producing
/// mode; callers only reach this after checking [`PlayMode::is_audio`].
pub fn print(module: &Module, play_mode: PlayMode) {
    match play_mode {
        PlayMode::Info => print_info(module),
        PlayMode::Text => print_text(module),
        _ => {}
    }
}

fn print_info(module: &Module) {
    println!("Module:");
    println!("\tName: {}", module.title);
    println!("\tPatterns: {}", module.patterns.len());
    let order_word = if module.song_length > 1 { "orders" } else { "order" };
    println!("\tLength: {} {}", module.song_length, order_word);
    println!("\tChannels: {} - {}", module.channel_count, module.format_name);
    println!("Samples:");
    for (i, sample) in module.samples.iter().enumerate() {
        if sample.length == 0 {
            continue;
        }
        let loop_string = if !sample.is_looping() {
            "Loop: None".to_string()
        } else {
            format!(
                "Loop start:{}, Loop length: {}",
                sample.loop_start, sample.loop_length
            )
        };
        println!("\t{:2}. {}", i + 1, sample.name);
        println!(
            "\t\tLength: {}, {}, Finetune: {}, Volume: {}",
            sample.length,
            loop_string,
            sample.signed_finetune(),
            sample.volume
        );
    }
}

fn print_text(module: &Module) {
    println!("Module text:");
    println!();
    for sample in module.samples.iter().take(31) {
        println!("{}", sample.name);
    }
}
