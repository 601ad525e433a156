pub mod llm {
    use thiserror::Error;

    /// Per-call options handed to a [`TextGenerator`].
    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct GenOpts {
        /// Sequences that end generation; a trailing match is cut from the output.
        pub stop: Option<Vec<String>>,
        /// Caller session the generation belongs to. Providers that support
        /// server-side aborts key their in-flight jobs by it.
        pub channel: Option<String>,
    }

    impl GenOpts {
        pub fn with_stop<I, S>(mut self, stop: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            self.stop = Some(stop.into_iter().map(Into::into).collect());
            self
        }

        pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
            self.channel = Some(channel.into());
            self
        }

        pub fn stop_sequences(&self) -> Option<&[String]> {
            self.stop.as_deref()
        }

        pub fn channel(&self) -> Option<&str> {
            self.channel.as_deref()
        }
    }

    #[derive(Error, Debug)]
    pub enum GenError {
        #[error("transport: {0}")] Transport(String),
        #[error("unexpected response format: {payload}")] MalformedResponse { payload: String },
        #[error("endpoint unavailable: {0}")] EndpointUnavailable(String),
    }

    impl GenError {
        /// Raw server payload for a malformed response, if that is what this is.
        pub fn payload(&self) -> Option<&str> {
            match self {
                GenError::MalformedResponse { payload } => Some(payload),
                _ => None,
            }
        }
    }

    /// A callable text generator with a blocking and a non-blocking entry point.
    ///
    /// Both entry points take the same inputs and must produce the same
    /// output for the same server response; they only differ in how the
    /// caller waits.
    #[allow(async_fn_in_trait)]
    pub trait TextGenerator: Send + Sync {
        /// Short identifier of the backend family.
        fn llm_type(&self) -> &'static str;

        /// Blocks the calling thread until the text is generated.
        ///
        /// Must not be called from inside an async runtime.
        fn generate(&self, prompt: &str, opts: &GenOpts) -> Result<String, GenError>;

        async fn agenerate(&self, prompt: &str, opts: &GenOpts) -> Result<String, GenError>;
    }
}
