mod bogus_flow;
mod string_encryption;
