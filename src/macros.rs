//! Declarative helpers for the protocol tables (command codes, versions, error codes).

/// Defines `CommandType` with a lossless `u32` mapping.
macro_rules! define_command_type {
    ($($name:ident = $val:literal),* $(,)?) => {
        /// Command codes carried in the frame header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($name = $val),*
        }

        impl CommandType {
            pub fn from_u32(value: u32) -> Option<Self> {
                match value {
                    $($val => Some(CommandType::$name),)*
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(CommandType::$name => stringify!($name),)*
                }
            }
        }

        impl From<CommandType> for u32 {
            fn from(cmd: CommandType) -> u32 {
                cmd as u32
            }
        }
    };
}

/// Defines the supported protocol `Version`s with their wire string.
macro_rules! define_version {
    ($($name:ident = $text:literal),* $(,)?) => {
        /// Tuya local protocol version. Selected by configuration, never negotiated.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Version {
            $($name),*
        }

        impl Version {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Version::$name => $text,)*
                }
            }

            /// Version string as it appears in the payload header (e.g. `b"3.3"`).
            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok(Version::$name),)*
                    other => Err($crate::error::TuyaError::InvalidConfig(format!(
                        "unsupported protocol version '{}'",
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Defines numeric error code constants and `get_error_message`.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),* $(,)?) => {
        $(pub const $name: u32 = $code;)*

        /// Human readable text for a numeric error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)*
                _ => "Unknown Error",
            }
        }
    };
}
