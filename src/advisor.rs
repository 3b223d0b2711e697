use crate::analysis::AnalysisGateway;
use crate::auth::{ validate_registration, CredentialService, PasswordScheme };
use crate::chat::{ ConversationGateway, Dialogue };
use crate::cli::Args;
use crate::error::AppError;
use crate::history::HistoryLedger;
use crate::llm::{ new_clients, DialogueClient, LlmConfig, LlmType, VisionClient };
use crate::models::report::AnalysisReport;
use crate::models::user::User;
use crate::storage::{ initialize_store, KeyValueStore };

use log::{ error, info, warn };
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Everything one running instance does for its signed-in user: credentials,
/// analyses and their history, and the assistant dialogue.
pub struct Advisor {
    auth: CredentialService,
    ledger: HistoryLedger,
    analysis: AnalysisGateway,
    conversation: ConversationGateway,
    analysis_lock: Mutex<()>,
}

impl Advisor {
    fn initialize_llm_clients(
        args: &Args
    ) -> Result<(Arc<dyn VisionClient>, Arc<dyn DialogueClient>), Box<dyn Error + Send + Sync>> {
        let llm_type: LlmType = args.llm_type.parse()?;
        let api_key = if !args.api_key.is_empty() { Some(args.api_key.clone()) } else { None };
        let config = LlmConfig {
            llm_type,
            api_key,
            model: args.llm_model.clone(),
            base_url: args.llm_base_url.clone(),
        };
        let clients = new_clients(&config)?;
        info!(
            "LLM client configured: Type={}, Model={:?}, BaseURL={:?}",
            args.llm_type,
            config.model.as_deref().unwrap_or("adapter default"),
            config.base_url.as_deref().unwrap_or("adapter default")
        );
        Ok((clients.vision, clients.dialogue))
    }

    pub async fn new(args: Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let store = initialize_store(&args)?;
        let (vision, dialogue) = Self::initialize_llm_clients(&args)?;
        let scheme: PasswordScheme = args.password_scheme.parse()?;
        let timeout = match args.analysis_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let advisor = Self::with_components(
            store,
            vision,
            dialogue,
            scheme,
            args.max_upload_bytes,
            timeout
        );
        advisor.restore_session().await?;
        Ok(advisor)
    }

    pub fn with_components(
        store: Arc<dyn KeyValueStore>,
        vision: Arc<dyn VisionClient>,
        dialogue: Arc<dyn DialogueClient>,
        scheme: PasswordScheme,
        max_upload_bytes: usize,
        analysis_timeout: Option<Duration>
    ) -> Self {
        Self {
            auth: CredentialService::new(Arc::clone(&store), scheme),
            ledger: HistoryLedger::new(store),
            analysis: AnalysisGateway::new(vision, max_upload_bytes, analysis_timeout),
            conversation: ConversationGateway::new(dialogue),
            analysis_lock: Mutex::new(()),
        }
    }

    /// Picks up a session left by a previous run and loads that user's history.
    /// If the history cannot be loaded the stale session is dropped, so no
    /// signed-in user is ever left without a working copy.
    pub async fn restore_session(&self) -> Result<Option<User>, AppError> {
        let user = match self.auth.current_user().await? {
            Some(user) => user,
            None => {
                return Ok(None);
            }
        };
        if let Err(e) = self.ledger.load(&user.email).await {
            error!("Could not load history for {}; signing out: {}", user.email, e);
            if let Err(logout_err) = self.auth.logout().await {
                error!("Failed to clear session: {}", logout_err);
            }
            return Err(e);
        }
        info!("Restored session for {}", user.email);
        Ok(Some(user))
    }

    /// Loads the history first and writes the session only once it is in
    /// memory.
    async fn sign_in(&self, user: User) -> Result<User, AppError> {
        self.ledger.load(&user.email).await?;
        if let Err(e) = self.auth.establish_session(&user).await {
            self.ledger.clear().await;
            return Err(e);
        }
        info!("Signed in {}", user.email);
        Ok(user)
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<User, AppError> {
        validate_registration(name, email, password)?;
        let user = self.auth.create_account(name.trim(), email, password).await?;
        self.sign_in(user).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User, AppError> {
        let user = self.auth.authenticate(email, password).await?;
        self.sign_in(user).await
    }

    pub async fn logout(&self) -> Result<(), AppError> {
        self.auth.logout().await?;
        self.ledger.clear().await;
        info!("Signed out");
        Ok(())
    }

    pub async fn current_user(&self) -> Result<Option<User>, AppError> {
        self.auth.current_user().await
    }

    pub async fn require_user(&self) -> Result<User, AppError> {
        self.current_user().await?.ok_or(AppError::NotAuthenticated)
    }

    /// Analyzes one image for the signed-in user and records the report.
    /// Only one analysis runs at a time; a second caller gets `AnalysisInProgress`.
    pub async fn analyze(&self, image: &[u8], mime_type: &str) -> Result<AnalysisReport, AppError> {
        let user = self.require_user().await?;
        let _guard = self.analysis_lock.try_lock().map_err(|_| {
            warn!("Rejected analysis for {}: another one is running", user.email);
            AppError::AnalysisInProgress
        })?;

        let report = self.analysis.analyze(image, mime_type).await?;
        if let Err(e) = self.ledger.append(&user.email, report.clone()).await {
            // The report stays visible in this run's history but is not durable.
            error!("Report {} was not saved: {}", report.id, e);
        }
        Ok(report)
    }

    pub async fn history(&self) -> Result<Vec<AnalysisReport>, AppError> {
        let user = self.require_user().await?;
        Ok(self.ledger.entries(&user.email).await)
    }

    /// The shared assistant dialogue, available to a signed-in user.
    pub async fn dialogue(&self) -> Result<Arc<Dialogue>, AppError> {
        self.require_user().await?;
        Ok(self.conversation.dialogue())
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.analysis.max_upload_bytes()
    }
}
