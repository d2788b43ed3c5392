use core::fmt::{self, Display, Formatter};

macro_rules! statuses {
    ($($(#[$meta:meta])* $name:ident = $code:literal,)*) => {
        /// SMTP reply codes the relay sends.
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
        pub enum Status {
            $($(#[$meta])* $name,)*
        }

        impl Status {
            /// The three digit reply code
            pub const fn code(self) -> u32 {
                match self {
                    $(Self::$name => $code,)*
                }
            }
        }
    };
}

statuses! {
    HelpMessage = 214,
    ServiceReady = 220,
    GoodBye = 221,
    Ok = 250,
    /// `VRFY` is not supported, but the message would be accepted
    CannotVerify = 252,
    StartMailInput = 354,
    /// Timeout or shutdown; the connection is about to close
    Unavailable = 421,
    /// The delivery queue is full
    InsufficientStorage = 452,
    SyntaxError = 500,
    ParameterSyntaxError = 501,
    InvalidCommandSequence = 503,
    /// Refused source or recipient
    Error = 550,
    ExceededStorage = 552,
    TransactionFailed = 554,
}

impl Status {
    pub const fn is_permanent(self) -> bool {
        self.code() >= 500
    }

    /// A 4xx reply: the client should try again later
    pub const fn is_temporary(self) -> bool {
        matches!(self.code(), 400..=499)
    }
}

impl From<Status> for u32 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.code())
    }
}
