use redis::Script;
use std::sync::LazyLock;

pub const INSERT_DOCUMENTS_SCRIPT_BODY: &str = include_str!("../../lua/insert_documents.lua");
pub const UPDATE_DOCUMENTS_SCRIPT_BODY: &str =
    concat!(include_str!("../../lua/document.lua"), include_str!("../../lua/update_documents.lua"));
pub const DELETE_DOCUMENTS_SCRIPT_BODY: &str =
    concat!(include_str!("../../lua/document.lua"), include_str!("../../lua/delete_documents.lua"));

pub static INSERT_DOCUMENTS_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(INSERT_DOCUMENTS_SCRIPT_BODY));
pub static UPDATE_DOCUMENTS_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(UPDATE_DOCUMENTS_SCRIPT_BODY));
pub static DELETE_DOCUMENTS_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(DELETE_DOCUMENTS_SCRIPT_BODY));
