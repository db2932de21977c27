//! エラーメッセージ定数

/// プロセスに接続されていない場合のエラーメッセージ
pub const ERR_NOT_ATTACHED: &str = "Not attached to a process";

/// バイナリが読み込まれていない場合のエラーメッセージ
pub const ERR_BINARY_NOT_LOADED: &str = "No binary loaded";

/// プロセスが終了済みの場合のエラーメッセージ
pub const ERR_PROCESS_EXITED: &str = "Process has already exited";

/// 停止中のスレッドがない場合のエラーメッセージ
pub const ERR_NO_STOPPED_THREAD: &str = "No stopped thread to inspect";
