// 上传编排模块
//
// - session: 会话、位图与分片偏移计算
// - hash: 分片哈希清单与文件哈希
// - cache: 进行中会话的内存缓存
// - buffer: 不支持原生分片上传时的本地缓冲文件
// - orchestrator: Preup / UploadSlice / SliceComplete 状态机
// - proxy: 缓冲文件的后台上传任务

pub mod buffer;
pub mod cache;
pub mod hash;
pub mod orchestrator;
pub mod proxy;
pub mod session;

pub use buffer::TempBuffer;
pub use cache::{SessionCache, SessionHandle};
pub use hash::{hash_file, slice_md5, HashInfo};
pub use orchestrator::{CompleteResult, PreupResult, SliceOutcome, UploadOrchestrator};
pub use proxy::{ProxyUploadHandler, PROXY_UPLOAD_TASK};
pub use session::{slice_count, SessionStatus, SliceBitmap, UploadSession};
