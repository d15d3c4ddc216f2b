//! Method names used on the wire.

// Client -> server requests
pub const PING: &str = "ping";
pub const STATUS_GET: &str = "status.get";
pub const SESSION_CREATE: &str = "session.create";
pub const SESSION_RESUME: &str = "session.resume";
pub const SESSION_SEND: &str = "session.send";
pub const SESSION_GET_MESSAGES: &str = "session.getMessages";
pub const SESSION_ABORT: &str = "session.abort";
pub const SESSION_DESTROY: &str = "session.destroy";
pub const SESSION_DELETE: &str = "session.delete";
pub const SESSION_LIST: &str = "session.list";
pub const SESSION_GET_LAST_ID: &str = "session.getLastId";

// Client -> server notifications
pub const TOOLS_REGISTER: &str = "session.tools.register";
pub const TOOLS_UNREGISTER: &str = "session.tools.unregister";

// Server -> client requests
pub const TOOL_CALL: &str = "tool.call";
pub const PERMISSION_REQUEST: &str = "permission.request";
pub const USER_INPUT_REQUEST: &str = "userInput.request";
pub const HOOKS_INVOKE: &str = "hooks.invoke";

// Server -> client notifications
pub const SESSION_EVENT: &str = "session.event";
