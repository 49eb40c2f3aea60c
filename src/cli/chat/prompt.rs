use rustyline::{Config, Editor, Result};

pub fn generate_prompt(custom_prompt: Option<&str>) -> String {
    custom_prompt.unwrap_or("> ").to_string()
}

pub fn rl() -> Result<Editor<()>> {
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(false)
        .build();
    Editor::with_config(config)
}

/// Ask for a single value on its own line.
pub fn read_field(label: &str) -> Result<String> {
    let mut editor = rl()?;
    let value = editor.readline(&generate_prompt(Some(format!("{}: ", label).as_str())))?;
    Ok(value)
}
