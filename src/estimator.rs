const ASCII_CHARS_PER_TOKEN: f64 = 4.0;
const WIDE_CHARS_PER_TOKEN: f64 = 1.5;

pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let (ascii, wide) = text.chars().fold((0u64, 0u64), |(ascii, wide), ch| {
        if ch.is_ascii() {
            (ascii + 1, wide)
        } else {
            (ascii, wide + 1)
        }
    });

    let raw = ascii as f64 / ASCII_CHARS_PER_TOKEN + wide as f64 / WIDE_CHARS_PER_TOKEN;
    raw.ceil() as u64
}
