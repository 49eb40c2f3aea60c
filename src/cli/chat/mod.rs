pub mod conversation_state;
pub mod prompt;
pub mod render;
pub mod session;
pub mod store;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use crossterm::cursor::MoveToColumn;
use crossterm::style::{Print, Stylize};
use crossterm::terminal::{Clear, ClearType};
use crossterm::execute;
use eyre::Result;
use prompt::generate_prompt;
use render::MarkdownRenderer;
use session::{ChatSession, SendOutcome};
use store::KeyValueStore;
use tracing::{debug, warn};

use crate::api_client::ChatBackend;
use crate::cli::auth;

const WELCOME_TEXT: &str = "
Dr. Chatbot, your friendly AI health assistant.
AI responses can be inaccurate. Always consult a real doctor.

/help         Show the help dialogue
/quit         Quit the application
";

const HELP_TEXT: &str = "
Dr. Chatbot CLI

/new          Start a new conversation (alias: /clear)
/logout       Log out and leave the chat
/help         Show this help dialogue
/quit         Quit the application
";

const PENDING_TEXT: &str = "Dr. Chatbot is typing...";

/// What the loop should do after handling one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub struct ChatContext {
    output: Box<dyn Write>,
    input: Option<String>,
    interactive: bool,
    color: bool,
    store: Arc<dyn KeyValueStore>,
    session: ChatSession,
    backend: Box<dyn ChatBackend>,
    renderer: MarkdownRenderer,
}

impl ChatContext {
    pub fn new(
        output: Box<dyn Write>,
        input: Option<String>,
        interactive: bool,
        color: bool,
        store: Arc<dyn KeyValueStore>,
        backend: Box<dyn ChatBackend>,
    ) -> Result<Self> {
        let session = ChatSession::open(store.clone());
        let renderer = MarkdownRenderer::new(color);

        Ok(Self {
            output,
            input,
            interactive,
            color,
            store,
            session,
            backend,
            renderer,
        })
    }

    pub async fn run(&mut self) -> Result<ExitCode> {
        if self.interactive {
            self.print_welcome()?;
        }

        // Handle non-interactive mode (single query)
        if let Some(input) = self.input.take() {
            self.handle_input(&input).await?;
            return Ok(ExitCode::SUCCESS);
        }

        if self.interactive {
            self.run_interactive().await?;
        }

        Ok(ExitCode::SUCCESS)
    }

    fn print_welcome(&mut self) -> Result<()> {
        writeln!(self.output, "{}", WELCOME_TEXT)?;

        if !auth::is_logged_in(self.store.as_ref()) {
            warn!("No auth token stored");
            writeln!(
                self.output,
                "You are not logged in. Run `dr-chatbot login` or `dr-chatbot signup` to sign in.\n"
            )?;
        }

        self.print_transcript()
    }

    fn print_transcript(&mut self) -> Result<()> {
        for message in self.session.messages() {
            writeln!(self.output, "{}\n", self.renderer.message(message))?;
        }
        Ok(())
    }

    async fn run_interactive(&mut self) -> Result<()> {
        let mut rl = prompt::rl()?;

        loop {
            let prompt_text = generate_prompt(None);
            let readline = rl.readline(&prompt_text);

            match readline {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }

                    rl.add_history_entry(line.as_str());

                    match self.handle_input(&line).await {
                        Ok(Flow::Exit) => break,
                        Ok(Flow::Continue) => {}
                        Err(e) => writeln!(self.output, "Error: {}", e)?,
                    }
                }
                Err(rustyline::error::ReadlineError::Interrupted)
                | Err(rustyline::error::ReadlineError::Eof) => break,
                Err(e) => {
                    writeln!(self.output, "Error: {}", e)?;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_input(&mut self, input: &str) -> Result<Flow> {
        match input.trim() {
            "/help" => {
                writeln!(self.output, "{}", HELP_TEXT)?;
            }
            "/new" | "/clear" => {
                self.session.new_conversation();
                writeln!(self.output, "Started a new conversation.\n")?;
                self.print_transcript()?;
            }
            "/logout" => {
                self.session.log_out();
                writeln!(
                    self.output,
                    "Logged out. Your conversation history has been kept."
                )?;
                return Ok(Flow::Exit);
            }
            "/quit" => return Ok(Flow::Exit),
            _ => self.process_chat_input(input).await?,
        }

        Ok(Flow::Continue)
    }

    async fn process_chat_input(&mut self, input: &str) -> Result<()> {
        if self.session.is_pending() {
            writeln!(self.output, "Still waiting for the previous reply.")?;
            return Ok(());
        }
        if !self.session.can_submit(input) {
            debug!("Submit ignored");
            return Ok(());
        }

        self.show_pending()?;
        let outcome = self.session.send(self.backend.as_ref(), input).await;
        self.clear_pending()?;

        if let Some(SendOutcome::Appended(message)) = outcome {
            writeln!(self.output, "{}\n", self.renderer.message(&message))?;
        }

        Ok(())
    }

    fn show_pending(&mut self) -> Result<()> {
        // Only draw the indicator when it can be erased again
        if self.color {
            execute!(self.output, Print(PENDING_TEXT.dim()))?;
        }
        Ok(())
    }

    fn clear_pending(&mut self) -> Result<()> {
        if self.color {
            execute!(self.output, MoveToColumn(0), Clear(ClearType::CurrentLine))?;
        }
        Ok(())
    }
}
