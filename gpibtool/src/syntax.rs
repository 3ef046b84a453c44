//! Reference text printed by `gpibtool syntax`.

/// Notation used in the grammar below.
pub const NOTATION: &[(&str, &str)] = &[
    ("<>", "a defined element"),
    ("::=", "is defined as"),
    ("|", "either the left or the right element"),
    ("{}", "a group of which exactly one element is required"),
    ("[]", "optional, may be omitted"),
    ("...", "the previous element may repeat"),
];

/// Accepted resource address forms. Keywords are case-insensitive and the
/// board number defaults to 0.
pub const ADDRESSES: &[(&str, &str)] = &[
    ("GPIB[board]::<primary>[::<secondary>][::INSTR]", "GPIB instrument, primary and secondary 0..=30"),
    ("GPIB[board]::INTFC", "GPIB controller board"),
    ("ASRL<port>[::INSTR]", "serial port, by number or device path"),
    ("TCPIP[board]::<host>[::<lan device>][::INSTR]", "VXI-11 / HiSLIP instrument"),
    ("TCPIP[board]::<host>::<port>::SOCKET", "raw TCP socket"),
    ("USB[board]::<vendor>::<product>::<serial>[::<interface>][::INSTR]", "USBTMC instrument"),
    ("USB[board]::<vendor>::<product>::<serial>[::<interface>]::RAW", "raw USB device"),
];

/// Elements of an IEEE 488.2 program message.
pub const MESSAGE_ELEMENTS: &[(&str, &str)] = &[
    (
        "<Header>",
        "The command name. A header ending in `?` is a query. Headers may start with `:`, which is required when commands are concatenated, but never before a common command starting with `*`.",
    ),
    (
        "<Mnemonic>",
        "One level of a header. Multiple mnemonics are separated by `:`.",
    ),
    (
        "<Argument>",
        "A value qualifying the header. A space separates the first argument from the header, commas separate arguments from each other.",
    ),
    (
        "<Comma>",
        "Separator between arguments, optionally surrounded by white space.",
    ),
    (
        "<Space>",
        "One or more white space characters between header and arguments.",
    ),
];

pub const COMMAND_FORM: &str = "[:]<Header>[<Space><Argument>[<Comma><Argument>]...]";

pub const QUERY_FORMS: &[&str] = &[
    "[:]<Header>?",
    "[:]<Header>?[<Space><Argument>[<Comma><Argument>]...]",
];
