//! Process exit codes. Values are fixed by the external contract every
//! binary in this workspace honors; do not renumber these.

common::enum_def_with_unknown!(ExitCode u8 =>
    Ok = 0,
    ParseFail = 50,
    BadOption = 51,
    ExecError = 52,
    SelfKill = 53,
    StopAllReq = 54,
    LeftLoop = 55,
    ShutDown = 56,
    PidLock = 57,
    InitFailed = 58,
    NoMemory = 59,
    BadLogic = 60,
    Assertion = 61
);

impl ExitCode {
    pub fn exit(self) -> ! {
        std::process::exit(self.to_value() as i32)
    }
}
