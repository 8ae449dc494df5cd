//! Reply-token policy helpers.
//!
//! `fuser`'s `Reply*` types already are the one-shot reply token spec.md
//! section 4.2 describes: each is a consuming type, replying more than once
//! is a compile error (the value is gone), and `fuser` itself is
//! responsible for the drop-without-reply warning. What this module adds is
//! the policy layered on top in `original_source/pafs/fuse.cc`:
//! `ReplyFailureAndLogIfNotOk` and `ReplyAlwaysAndLogIfNotOk`, generalized
//! across every `Reply*` type the dispatcher uses.

use fuser::Errno;
use fuser::ReplyEmpty;
use log::error;

use crate::error::Error;

fn errno_of(err: &Error) -> Errno {
    Errno::from_i32(err.errno())
}

/// Any fuser reply type that can be consumed by an error.
pub trait FuseReply {
    fn fail(self, err: &Error);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl FuseReply for $ty {
                fn fail(self, err: &Error) {
                    self.error(errno_of(err));
                }
            }
        )+
    };
}

impl_fuse_reply!(
    fuser::ReplyAttr,
    fuser::ReplyEntry,
    fuser::ReplyData,
    fuser::ReplyEmpty,
    fuser::ReplyOpen,
    fuser::ReplyWrite,
    fuser::ReplyStatfs,
    fuser::ReplyCreate,
    fuser::ReplyLock,
    fuser::ReplyLseek,
    fuser::ReplyPoll,
    fuser::ReplyXattr,
    fuser::ReplyDirectory,
    fuser::ReplyDirectoryPlus,
);

/// If `result` failed, logs it and consumes `reply` with the mapped errno,
/// returning `None`. If it succeeded, returns `Some(reply)` so the caller
/// can finish replying with the operation's actual typed result.
///
/// Mirrors `ReplyFailureAndLogIfNotOk`'s "ok -> leave reply to handler"
/// branch.
pub fn fail_or_log<R: FuseReply>(reply: R, result: Result<(), Error>) -> Option<R> {
    match result {
        Ok(()) => Some(reply),
        Err(err) => {
            error!("{err}");
            reply.fail(&err);
            None
        }
    }
}

/// Always consumes `reply`: `ok()` on success, logs and replies the mapped
/// errno on failure. Mirrors `ReplyAlwaysAndLogIfNotOk`.
pub fn ok_or_log(reply: ReplyEmpty, result: Result<(), Error>) {
    match result {
        Ok(()) => reply.ok(),
        Err(err) => {
            error!("{err}");
            reply.error(errno_of(&err));
        }
    }
}
