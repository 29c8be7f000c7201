use lockstep::error::AppResult;

fn main() -> AppResult<()> {
    lockstep::entry::run()
}
